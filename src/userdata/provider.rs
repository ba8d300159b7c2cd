//! Type to descriptor associations

use std::any::TypeId;
use std::collections::HashMap;
use std::rc::Rc;

use super::descriptor::UserDataDescriptor;
use super::function::{FunctionDescriptor, HostFunction};
use super::HostType;

/// Resolves the descriptor of a host type.
///
/// Host functions always get the built-in call-forwarding descriptor. Other
/// types use the descriptor registered for the type itself or, failing that,
/// for the nearest base type it lists.
pub struct DescriptorProvider {
    registered: HashMap<TypeId, Rc<dyn UserDataDescriptor>>,
    function: Rc<dyn UserDataDescriptor>,
}

impl DescriptorProvider {
    pub fn new() -> Self {
        DescriptorProvider {
            registered: HashMap::new(),
            function: Rc::new(FunctionDescriptor),
        }
    }

    /// Associate `descriptor` with `T`, replacing any earlier association
    pub fn register<T: HostType>(&mut self, descriptor: Rc<dyn UserDataDescriptor>) {
        if self.registered.insert(TypeId::of::<T>(), descriptor).is_some() {
            tracing::debug!(type_name = T::type_name(), "replaced userdata descriptor");
        }
    }

    pub fn unregister<T: HostType>(&mut self) -> Option<Rc<dyn UserDataDescriptor>> {
        self.registered.remove(&TypeId::of::<T>())
    }

    pub fn is_registered<T: HostType>(&self) -> bool {
        self.registered.contains_key(&TypeId::of::<T>())
    }

    pub fn resolve<T: HostType>(&self) -> Option<Rc<dyn UserDataDescriptor>> {
        self.resolve_type(TypeId::of::<T>(), &T::base_types())
    }

    /// Most specific descriptor for `type_id`; `bases` lists ancestors nearest first
    pub fn resolve_type(&self, type_id: TypeId, bases: &[TypeId]) -> Option<Rc<dyn UserDataDescriptor>> {
        if type_id == TypeId::of::<HostFunction>() {
            return Some(self.function.clone());
        }

        std::iter::once(&type_id)
            .chain(bases)
            .find_map(|candidate| self.registered.get(candidate))
            .cloned()
    }
}

impl Default for DescriptorProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl UserDataDescriptor for Named {
        fn metatable_name(&self) -> &str {
            self.0
        }
    }

    struct Shape;
    struct Circle;
    struct Unit;

    impl HostType for Shape {}
    impl HostType for Unit {}
    impl HostType for Circle {
        fn base_types() -> Vec<TypeId> {
            vec![TypeId::of::<Shape>()]
        }
    }

    #[test]
    fn test_derived_type_uses_base_descriptor() {
        let mut provider = DescriptorProvider::new();
        provider.register::<Shape>(Rc::new(Named("shape")));

        let resolved = provider.resolve::<Circle>().unwrap();
        assert_eq!(resolved.metatable_name(), "shape");
        assert!(provider.resolve::<Unit>().is_none());
    }

    #[test]
    fn test_most_derived_registration_wins() {
        let mut provider = DescriptorProvider::new();
        provider.register::<Shape>(Rc::new(Named("shape")));
        provider.register::<Circle>(Rc::new(Named("circle")));

        assert_eq!(provider.resolve::<Circle>().unwrap().metatable_name(), "circle");
        assert_eq!(provider.resolve::<Shape>().unwrap().metatable_name(), "shape");

        provider.unregister::<Circle>();
        assert_eq!(provider.resolve::<Circle>().unwrap().metatable_name(), "shape");
    }

    #[test]
    fn test_host_functions_get_builtin_descriptor() {
        let mut provider = DescriptorProvider::new();
        provider.register::<HostFunction>(Rc::new(Named("custom")));

        let resolved = provider.resolve::<HostFunction>().unwrap();
        assert_eq!(resolved.metatable_name(), "function");
    }
}
