//! Member tables for host types
//!
//! [`MembersBuilder`] declares the properties, fields and methods of a host
//! type once. [`MembersBuilder::build`] applies a [`MemberFilter`] and
//! produces an [`ObjectDescriptor`] holding an immutable name to accessor map,
//! so lookups never re-run the exposure rules.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::convert::{FromLua, IntoLua};
use crate::error::{LuaError, Result};
use crate::state::Lua;
use crate::value::{MultiValue, Value};

use super::descriptor::UserDataDescriptor;
use super::function::HostFunction;
use super::{HostType, UserDataHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Property,
    Field,
    Method,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    NonPublic,
}

/// Explicit exposure marker on a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Annotation {
    #[default]
    Unmarked,
    Include,
    Exclude,
}

/// Type a member is declared on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclaringType {
    pub name: &'static str,

    /// Whether the type opted in to exposing its members under strict filtering
    pub opted_in: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    pub kind: MemberKind,
    pub visibility: Visibility,
    pub annotation: Annotation,
    pub declaring_type: DeclaringType,
}

/// Decides which members are visible to scripts.
///
/// A member is exposed when it is not excluded, it is public or explicitly
/// included, and in strict mode its declaring type opted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberFilter {
    pub strict: bool,
}

impl MemberFilter {
    pub fn strict() -> Self {
        MemberFilter { strict: true }
    }

    pub fn exposes(&self, member: &MemberInfo) -> bool {
        if member.annotation == Annotation::Exclude {
            return false;
        }
        if member.visibility != Visibility::Public && member.annotation != Annotation::Include {
            return false;
        }
        !self.strict || member.declaring_type.opted_in
    }
}

type Getter<T> = dyn Fn(&Lua, &T) -> Result<Value>;
type Setter<T> = dyn Fn(&Lua, &T, Value) -> Result<()>;

enum Accessor<T> {
    Value {
        getter: Rc<Getter<T>>,
        setter: Option<Rc<Setter<T>>>,
    },
    Method(Rc<HostFunction>),
    Overloaded(usize),
}

struct Declared<T> {
    info: MemberInfo,
    accessor: Accessor<T>,
}

/// Fluent declaration of the members of `T`.
///
/// `non_public`, `include` and `exclude` apply to the member declared last.
pub struct MembersBuilder<T> {
    name: String,
    declaring_type: DeclaringType,
    members: Vec<Declared<T>>,
}

impl<T: HostType> MembersBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        MembersBuilder {
            name: name.into(),
            declaring_type: DeclaringType {
                name: T::type_name(),
                opted_in: false,
            },
            members: Vec::new(),
        }
    }

    /// Opt the current declaring type in for strict filtering
    pub fn opt_in(mut self) -> Self {
        self.declaring_type.opted_in = true;
        self
    }

    /// Members declared after this call belong to `declaring_type`
    pub fn declared_by(mut self, declaring_type: DeclaringType) -> Self {
        self.declaring_type = declaring_type;
        self
    }

    /// Read-only property
    pub fn property<V, G>(self, name: &str, getter: G) -> Self
    where
        V: IntoLua,
        G: Fn(&T) -> V + 'static,
    {
        self.push_value(name, MemberKind::Property, wrap_getter(getter), None)
    }

    pub fn property_with_setter<V, W, G, S>(self, name: &str, getter: G, setter: S) -> Self
    where
        V: IntoLua,
        W: FromLua,
        G: Fn(&T) -> V + 'static,
        S: Fn(&T, W) -> Result<()> + 'static,
    {
        self.push_value(name, MemberKind::Property, wrap_getter(getter), Some(wrap_setter(setter)))
    }

    /// Assignable field
    pub fn field<V, W, G, S>(self, name: &str, getter: G, setter: S) -> Self
    where
        V: IntoLua,
        W: FromLua,
        G: Fn(&T) -> V + 'static,
        S: Fn(&T, W) -> Result<()> + 'static,
    {
        self.push_value(name, MemberKind::Field, wrap_getter(getter), Some(wrap_setter(setter)))
    }

    /// Method called as `object:name(...)`; the receiver is checked to be a `T`.
    ///
    /// Declaring two exposed methods with the same name makes the name
    /// overloaded, which is not supported at call time.
    pub fn method<F>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(&Lua, &T, MultiValue) -> Result<MultiValue> + 'static,
    {
        let method_name = name.to_string();
        let function = HostFunction::new(move |lua, mut args| {
            let receiver = match args.pop_front() {
                Value::UserData(userdata) => userdata.downcast::<T>()?,
                _ => None,
            };
            let receiver = receiver.ok_or_else(|| {
                LuaError::runtime(format!(
                    "bad self for method '{}' ({} expected)",
                    method_name,
                    T::type_name()
                ))
            })?;
            method(lua, &*receiver, args)
        });

        let info = self.info(name, MemberKind::Method);
        self.members.push(Declared {
            info,
            accessor: Accessor::Method(Rc::new(function)),
        });
        self
    }

    pub fn non_public(mut self) -> Self {
        if let Some(last) = self.members.last_mut() {
            last.info.visibility = Visibility::NonPublic;
        }
        self
    }

    pub fn include(mut self) -> Self {
        self.annotate(Annotation::Include);
        self
    }

    pub fn exclude(mut self) -> Self {
        self.annotate(Annotation::Exclude);
        self
    }

    /// Apply `filter` and freeze the member table
    pub fn build(self, filter: MemberFilter) -> ObjectDescriptor<T> {
        let mut accessors: HashMap<String, Accessor<T>> = HashMap::new();
        let mut exposed = Vec::new();

        for member in self.members {
            if !filter.exposes(&member.info) {
                tracing::trace!(member = %member.info.name, "member hidden by filter");
                continue;
            }

            let name = member.info.name.clone();
            let accessor = match (accessors.remove(&name), member.accessor) {
                (Some(Accessor::Method(_)), Accessor::Method(_)) => Accessor::Overloaded(2),
                (Some(Accessor::Overloaded(count)), Accessor::Method(_)) => Accessor::Overloaded(count + 1),
                (_, accessor) => accessor,
            };
            accessors.insert(name, accessor);
            exposed.push(member.info);
        }

        ObjectDescriptor {
            name: self.name,
            accessors,
            exposed,
            _marker: PhantomData,
        }
    }

    fn info(&self, name: &str, kind: MemberKind) -> MemberInfo {
        MemberInfo {
            name: name.to_string(),
            kind,
            visibility: Visibility::Public,
            annotation: Annotation::Unmarked,
            declaring_type: self.declaring_type,
        }
    }

    fn annotate(&mut self, annotation: Annotation) {
        if let Some(last) = self.members.last_mut() {
            last.info.annotation = annotation;
        }
    }

    fn push_value(
        mut self,
        name: &str,
        kind: MemberKind,
        getter: Rc<Getter<T>>,
        setter: Option<Rc<Setter<T>>>,
    ) -> Self {
        let info = self.info(name, kind);
        self.members.push(Declared {
            info,
            accessor: Accessor::Value { getter, setter },
        });
        self
    }
}

fn wrap_getter<T, V, G>(getter: G) -> Rc<Getter<T>>
where
    V: IntoLua,
    G: Fn(&T) -> V + 'static,
{
    Rc::new(move |lua: &Lua, this: &T| getter(this).into_lua(lua))
}

fn wrap_setter<T, W, S>(setter: S) -> Rc<Setter<T>>
where
    W: FromLua,
    S: Fn(&T, W) -> Result<()> + 'static,
{
    Rc::new(move |lua: &Lua, this: &T, value: Value| setter(this, W::from_lua(value, lua)?))
}

/// Descriptor backed by a member table
pub struct ObjectDescriptor<T> {
    name: String,
    accessors: HashMap<String, Accessor<T>>,
    exposed: Vec<MemberInfo>,
    _marker: PhantomData<T>,
}

impl<T: HostType> ObjectDescriptor<T> {
    pub fn builder(name: impl Into<String>) -> MembersBuilder<T> {
        MembersBuilder::new(name)
    }

    /// Members that passed the filter, in declaration order
    pub fn members(&self) -> &[MemberInfo] {
        &self.exposed
    }

    pub fn exposes(&self, name: &str) -> bool {
        self.accessors.contains_key(name)
    }
}

impl<T: HostType> UserDataDescriptor for ObjectDescriptor<T> {
    fn metatable_name(&self) -> &str {
        &self.name
    }

    fn index(&self, lua: &Lua, this: &UserDataHandle, key: Value) -> Result<Option<Value>> {
        let Some(name) = key.as_str() else {
            return Ok(None);
        };
        let Some(accessor) = self.accessors.get(name) else {
            return Ok(None);
        };

        match accessor {
            Accessor::Value { getter, .. } => match this.downcast::<T>() {
                Some(object) => getter(lua, &*object).map(Some),
                None => Ok(None),
            },
            Accessor::Method(function) => function.clone().into_lua(lua).map(Some),
            Accessor::Overloaded(count) => Err(LuaError::NotSupported(format!(
                "calling '{}' with {} overloads",
                name, count
            ))),
        }
    }

    fn new_index(&self, lua: &Lua, this: &UserDataHandle, key: Value, value: Value) -> Result<bool> {
        let Some(name) = key.as_str() else {
            return Ok(false);
        };
        let Some(Accessor::Value {
            setter: Some(setter), ..
        }) = self.accessors.get(name)
        else {
            return Ok(false);
        };
        let Some(object) = this.downcast::<T>() else {
            return Ok(false);
        };
        setter(lua, &*object, value)?;
        Ok(true)
    }
}

impl<T> fmt::Debug for ObjectDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDescriptor")
            .field("name", &self.name)
            .field("members", &self.exposed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Account;

    impl HostType for Account {}

    fn member(visibility: Visibility, annotation: Annotation, opted_in: bool) -> MemberInfo {
        MemberInfo {
            name: "balance".to_string(),
            kind: MemberKind::Property,
            visibility,
            annotation,
            declaring_type: DeclaringType {
                name: "Account",
                opted_in,
            },
        }
    }

    #[test]
    fn test_exposure_rules() {
        let lenient = MemberFilter::default();
        let strict = MemberFilter::strict();

        assert!(lenient.exposes(&member(Visibility::Public, Annotation::Unmarked, false)));
        assert!(!lenient.exposes(&member(Visibility::NonPublic, Annotation::Unmarked, false)));
        assert!(lenient.exposes(&member(Visibility::NonPublic, Annotation::Include, false)));
        assert!(!lenient.exposes(&member(Visibility::Public, Annotation::Exclude, true)));

        assert!(!strict.exposes(&member(Visibility::Public, Annotation::Unmarked, false)));
        assert!(!strict.exposes(&member(Visibility::Public, Annotation::Include, false)));
        assert!(strict.exposes(&member(Visibility::Public, Annotation::Unmarked, true)));
        assert!(!strict.exposes(&member(Visibility::NonPublic, Annotation::Unmarked, true)));
    }

    #[test]
    fn test_build_applies_filter() {
        let descriptor = ObjectDescriptor::<Account>::builder("Account")
            .property("id", |_: &Account| 1i64)
            .property("secret", |_: &Account| "hidden")
            .non_public()
            .property("owner", |_: &Account| "ann")
            .exclude()
            .property("audit", |_: &Account| true)
            .non_public()
            .include()
            .build(MemberFilter::default());

        assert!(descriptor.exposes("id"));
        assert!(!descriptor.exposes("secret"));
        assert!(!descriptor.exposes("owner"));
        assert!(descriptor.exposes("audit"));
        assert_eq!(descriptor.members().len(), 2);
    }

    #[test]
    fn test_strict_filter_requires_opt_in() {
        let base = DeclaringType {
            name: "Base",
            opted_in: false,
        };
        let descriptor = ObjectDescriptor::<Account>::builder("Account")
            .opt_in()
            .property("id", |_: &Account| 1i64)
            .declared_by(base)
            .property("inherited", |_: &Account| 2i64)
            .build(MemberFilter::strict());

        assert!(descriptor.exposes("id"));
        assert!(!descriptor.exposes("inherited"));
    }
}
