//! Host objects as userdata
//!
//! A host object is pushed as a full userdata holding an anchor: a reference
//! counted record of the object, its type and its descriptor. Two uservalues
//! identify userdata created here: a fixed marker and a token equal to the
//! anchor's address. Pushing the same object twice yields the same userdata
//! while it is alive, through a weak-valued identity cache keyed by the
//! object's address.

mod descriptor;
mod function;
mod members;
mod metatable;
mod provider;

pub use descriptor::{ArithmeticOp, ComparisonOp, UserDataDescriptor};
pub use function::{HostCallback, HostFunction};
pub use members::{
    Annotation, DeclaringType, MemberFilter, MemberInfo, MemberKind, MembersBuilder, ObjectDescriptor, Visibility,
};
pub use provider::DescriptorProvider;

use std::any::{Any, TypeId};
use std::fmt;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::rc::Rc;

use mlua_sys as ffi;

use crate::error::Result;
use crate::protect::{check_stack, protect_lua_call};
use crate::reference::{LuaReference, LuaUserData, ReferenceKind};
use crate::registry::{self, WeakTable};
use crate::stack::StackGuard;
use crate::state::Lua;

static IDENTITY_MARKER: u8 = 5;

const USER_VALUE_MARKER: c_int = 1;
const USER_VALUE_ANCHOR: c_int = 2;

/// Host types that can be pushed as userdata
pub trait HostType: Any {
    /// Ancestor types, used to find a descriptor registered for a base type.
    ///
    /// List every ancestor, not only the direct parent.
    fn base_types() -> Vec<TypeId>
    where
        Self: Sized,
    {
        Vec::new()
    }

    /// Name used in diagnostics
    fn type_name() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

pub(crate) struct HostAnchor {
    object: Rc<dyn Any>,
    type_id: TypeId,
    type_name: &'static str,
    descriptor: Option<Rc<dyn UserDataDescriptor>>,
}

/// Host object carried by a userdata
#[derive(Clone)]
pub struct UserDataHandle {
    anchor: Rc<HostAnchor>,
}

impl UserDataHandle {
    pub fn object(&self) -> &Rc<dyn Any> {
        &self.anchor.object
    }

    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        self.anchor.object.clone().downcast::<T>().ok()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.anchor.type_id == TypeId::of::<T>()
    }

    pub fn type_name(&self) -> &'static str {
        self.anchor.type_name
    }

    pub fn descriptor(&self) -> Option<&Rc<dyn UserDataDescriptor>> {
        self.anchor.descriptor.as_ref()
    }

    /// Whether both handles carry the same host object
    pub fn ptr_eq(&self, other: &UserDataHandle) -> bool {
        object_address(&self.anchor.object) == object_address(&other.anchor.object)
    }

    fn display_name(&self) -> &str {
        match &self.anchor.descriptor {
            Some(descriptor) => descriptor.metatable_name(),
            None => self.anchor.type_name,
        }
    }
}

impl fmt::Debug for UserDataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:p}", self.display_name(), object_address(&self.anchor.object))
    }
}

/// Memory block of a host userdata
pub(crate) struct UserDataCell {
    anchor: Option<Rc<HostAnchor>>,
}

fn object_address(object: &Rc<dyn Any>) -> *const c_void {
    Rc::as_ptr(object) as *const u8 as *const c_void
}

impl Lua {
    /// Push a host object as userdata, reusing the existing userdata for the same object
    pub fn create_userdata<T: HostType>(&self, object: Rc<T>) -> Result<LuaUserData> {
        let state = self.state()?;
        let descriptor = self
            .extra()
            .descriptors
            .borrow()
            .resolve_type(TypeId::of::<T>(), &T::base_types());

        unsafe {
            let _guard = StackGuard::new(state);
            push_anchored(self, state, object, TypeId::of::<T>(), T::type_name(), descriptor)?;
            Ok(LuaUserData::from_reference(LuaReference::capture(self, state, -1)?))
        }
    }

    /// Associate `descriptor` with `T` and types listing `T` among their bases
    pub fn register_descriptor<T: HostType>(&self, descriptor: Rc<dyn UserDataDescriptor>) {
        self.extra().descriptors.borrow_mut().register::<T>(descriptor);
    }

    /// Descriptor that would be used for a `T`
    pub fn descriptor_for<T: HostType>(&self) -> Option<Rc<dyn UserDataDescriptor>> {
        self.extra().descriptors.borrow().resolve::<T>()
    }

    /// Member filter configured for reflection-style descriptors
    pub fn member_filter(&self) -> MemberFilter {
        self.extra().member_filter.get()
    }
}

/// Push the userdata for `object`, creating it on a cache miss
pub(crate) unsafe fn push_anchored(
    lua: &Lua,
    state: *mut ffi::lua_State,
    object: Rc<dyn Any>,
    type_id: TypeId,
    type_name: &'static str,
    descriptor: Option<Rc<dyn UserDataDescriptor>>,
) -> Result<()> {
    let extra = lua.extra();
    check_stack(state, 6)?;
    let address = object_address(&object);

    registry::push_weak_table(state, WeakTable::UserDataCache);
    ffi::lua_rawgetp(state, -1, address);
    if let Some(cached) = try_read_handle(state, -1) {
        if object_address(&cached.anchor.object) == address {
            ffi::lua_remove(state, -2);
            return Ok(());
        }
    }
    ffi::lua_pop(state, 2);

    let anchor = Rc::new(HostAnchor {
        object,
        type_id,
        type_name,
        descriptor,
    });
    let token = Rc::as_ptr(&anchor) as *mut c_void;

    // The anchor is stored last, once `__gc` is attached, so a failure on the
    // way leaves an empty block that the collector can drop.
    let cell = protect_lua_call(extra, state, 0, 1, |state| {
        ffi::lua_newuserdatauv(state, mem::size_of::<UserDataCell>(), 2) as *mut UserDataCell
    })?;
    ptr::write(cell, UserDataCell { anchor: None });

    metatable::push_metatable(lua, state, anchor.descriptor.as_deref())?;

    let marker = &IDENTITY_MARKER as *const u8 as *mut c_void;
    protect_lua_call(extra, state, 2, 1, |state| {
        ffi::lua_pushlightuserdata(state, marker);
        ffi::lua_setiuservalue(state, 1, USER_VALUE_MARKER);
        ffi::lua_pushlightuserdata(state, token);
        ffi::lua_setiuservalue(state, 1, USER_VALUE_ANCHOR);
        ffi::lua_setmetatable(state, 1);

        registry::push_weak_table(state, WeakTable::UserDataCache);
        ffi::lua_pushvalue(state, 1);
        ffi::lua_rawsetp(state, -2, address);
        ffi::lua_pop(state, 1);
    })?;
    (*cell).anchor = Some(anchor);

    tracing::trace!(type_name, "created host userdata");
    Ok(())
}

/// Memory block of the host userdata at `index`, or `None` for any other value.
///
/// A block qualifies when it has the size of a [`UserDataCell`], carries the
/// identity marker, and its anchor token matches the anchor it holds. Never
/// allocates and never raises.
pub(crate) unsafe fn host_cell(state: *mut ffi::lua_State, index: c_int) -> Option<*mut UserDataCell> {
    if ffi::lua_type(state, index) != ffi::LUA_TUSERDATA {
        return None;
    }
    let index = ffi::lua_absindex(state, index);
    if ffi::lua_rawlen(state, index) as usize != mem::size_of::<UserDataCell>() {
        return None;
    }
    if ffi::lua_checkstack(state, 2) == 0 {
        return None;
    }

    ffi::lua_getiuservalue(state, index, USER_VALUE_MARKER);
    let marked = ffi::lua_type(state, -1) == ffi::LUA_TLIGHTUSERDATA
        && ffi::lua_touserdata(state, -1) == &IDENTITY_MARKER as *const u8 as *mut c_void;
    ffi::lua_getiuservalue(state, index, USER_VALUE_ANCHOR);
    let token = if ffi::lua_type(state, -1) == ffi::LUA_TLIGHTUSERDATA {
        ffi::lua_touserdata(state, -1)
    } else {
        ptr::null_mut()
    };
    ffi::lua_pop(state, 2);

    if !marked || token.is_null() {
        return None;
    }

    let cell = ffi::lua_touserdata(state, index) as *mut UserDataCell;
    match &(*cell).anchor {
        Some(anchor) if Rc::as_ptr(anchor) as *mut c_void == token => Some(cell),
        _ => None,
    }
}

/// Handle of the host userdata at `index`, or `None` for any other value.
///
/// Never allocates and never raises.
pub(crate) unsafe fn try_read_handle(state: *mut ffi::lua_State, index: c_int) -> Option<UserDataHandle> {
    let cell = host_cell(state, index)?;
    (*cell).anchor.as_ref().map(|anchor| UserDataHandle {
        anchor: anchor.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        value: std::cell::Cell<i64>,
    }

    impl HostType for Counter {}

    #[test]
    fn test_same_object_same_userdata() {
        let lua = Lua::new().unwrap();
        let counter = Rc::new(Counter {
            value: std::cell::Cell::new(1),
        });

        let first = lua.create_userdata(counter.clone()).unwrap();
        let second = lua.create_userdata(counter.clone()).unwrap();
        assert_eq!(first, second);

        let other = lua.create_userdata(Rc::new(Counter {
            value: std::cell::Cell::new(2),
        }))
        .unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_handle_round_trip() {
        let lua = Lua::new().unwrap();
        let counter = Rc::new(Counter {
            value: std::cell::Cell::new(5),
        });

        let userdata = lua.create_userdata(counter.clone()).unwrap();
        let back = userdata.downcast::<Counter>().unwrap().unwrap();
        assert!(Rc::ptr_eq(&back, &counter));
        assert_eq!(back.value.get(), 5);
        assert!(userdata.is::<Counter>().unwrap());
        assert!(!userdata.is::<String>().unwrap());
    }

    #[test]
    fn test_object_released_after_collection() {
        let lua = Lua::new().unwrap();
        let counter = Rc::new(Counter {
            value: std::cell::Cell::new(0),
        });

        let userdata = lua.create_userdata(counter.clone()).unwrap();
        assert_eq!(Rc::strong_count(&counter), 2);

        drop(userdata);
        lua.gc().collect().unwrap();
        assert_eq!(Rc::strong_count(&counter), 1);
    }

    #[test]
    fn test_foreign_userdata_has_no_handle() {
        let lua = Lua::new().unwrap();
        let state = lua.state().unwrap();
        unsafe {
            let _guard = StackGuard::new(state);
            ffi::lua_newuserdatauv(state, 8, 2);
            assert!(try_read_handle(state, -1).is_none());
        }
    }
}
