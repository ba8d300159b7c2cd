//! Userdata references

use std::any::Any;
use std::rc::Rc;

use crate::error::Result;
use crate::stack::StackGuard;
use crate::userdata::{self, UserDataHandle};
use crate::value::ValueType;

use super::typed_reference;

typed_reference!(
    /// Reference to a full userdata
    LuaUserData,
    ValueType::UserData
);

impl LuaUserData {
    /// Host object carried by this userdata, if it was created by this crate
    pub fn handle(&self) -> Result<Option<UserDataHandle>> {
        let state = self.0.lua().state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.0.push_onto(state)?;
            Ok(userdata::try_read_handle(state, -1))
        }
    }

    /// Host object as `T`, if it is one
    pub fn downcast<T: Any>(&self) -> Result<Option<Rc<T>>> {
        Ok(self.handle()?.and_then(|handle| handle.downcast::<T>()))
    }

    pub fn is<T: Any>(&self) -> Result<bool> {
        Ok(self.handle()?.map_or(false, |handle| handle.is::<T>()))
    }
}
