//! Registry references, weak references and stack snapshots

use ferrolua::{Lua, LuaError, LuaTable, Value, ValueType};

#[test]
fn test_captured_table_round_trips() {
    let lua = Lua::new().unwrap();
    lua.execute("config = { name = 'primary', retries = 3 }").unwrap();

    let config: LuaTable = lua.get_global("config").unwrap();
    lua.execute("config = nil").unwrap();
    lua.gc().collect().unwrap();

    let name: String = config.get("name").unwrap();
    let retries: i64 = config.get("retries").unwrap();
    assert_eq!(name, "primary");
    assert_eq!(retries, 3);

    lua.set_global("restored", &config).unwrap();
    let same: bool = lua.evaluate("restored.retries == 3").unwrap();
    assert!(same);
}

#[test]
fn test_disposed_slot_is_released() {
    let lua = Lua::new().unwrap();
    let table = lua.create_table().unwrap();
    let slot = table.reference().slot().unwrap();
    assert_eq!(lua.registry_slot_type(slot).unwrap(), ValueType::Table);

    table.dispose();
    assert!(table.is_disposed());
    lua.gc().collect().unwrap();

    assert_ne!(lua.registry_slot_type(slot).unwrap(), ValueType::Table);
    assert!(matches!(table.reference().slot(), Err(LuaError::ObjectDisposed(_))));
}

#[test]
fn test_dispose_twice_is_harmless() {
    let lua = Lua::new().unwrap();
    let table = lua.create_table().unwrap();
    table.dispose();
    table.dispose();
    assert!(matches!(table.get::<_, Value>(1), Err(LuaError::ObjectDisposed(_))));
}

#[test]
fn test_clones_are_independent() {
    let lua = Lua::new().unwrap();
    let original = lua.create_table().unwrap();
    original.set("marker", 7).unwrap();

    let copy = original.try_clone().unwrap();
    assert_ne!(original.reference().slot().unwrap(), copy.reference().slot().unwrap());
    assert_eq!(original.reference(), copy.reference());

    original.dispose();
    let marker: i64 = copy.get("marker").unwrap();
    assert_eq!(marker, 7);
}

#[test]
fn test_clone_outlives_disposed_original() {
    let lua = Lua::new().unwrap();
    let first = lua.create_table().unwrap();
    let slot = first.reference().slot().unwrap();
    let second = first.try_clone().unwrap();

    first.dispose();
    lua.gc().collect().unwrap();
    assert_eq!(second.reference().value_type().unwrap(), ValueType::Table);

    let stack = lua.stack().unwrap();
    {
        let snapshot = stack.snapshot().unwrap();
        stack.push(&second).unwrap();
        assert_eq!(stack.count().unwrap(), snapshot.recorded_count() + 1);
    }

    second.dispose();
    lua.gc().collect().unwrap();
    assert_ne!(lua.registry_slot_type(slot).unwrap(), ValueType::Table);
}

#[test]
fn test_weak_reference_follows_collection() {
    let lua = Lua::new().unwrap();
    let table = lua.create_table().unwrap();
    let weak = table.downgrade().unwrap();

    {
        let strong = weak.try_get().unwrap();
        assert!(strong.is_some());
    }

    drop(table);
    lua.gc().collect().unwrap();
    lua.gc().collect().unwrap();

    assert!(weak.try_get().unwrap().is_none());
    assert!(!weak.is_alive().unwrap());
}

#[test]
fn test_weak_reference_does_not_keep_alive_while_strong_held() {
    let lua = Lua::new().unwrap();
    let table = lua.create_table().unwrap();
    let weak = table.downgrade().unwrap();
    lua.gc().collect().unwrap();
    assert!(weak.is_alive().unwrap());
    drop(table);
}

#[test]
fn test_snapshot_restores_height() {
    let lua = Lua::new().unwrap();
    let stack = lua.stack().unwrap();
    let before = stack.count().unwrap();

    {
        let snapshot = stack.snapshot().unwrap();
        assert_eq!(snapshot.recorded_count(), before);
        stack.push(1).unwrap();
        stack.push("two").unwrap();
        assert_eq!(stack.count().unwrap(), before + 2);
    }

    assert_eq!(stack.count().unwrap(), before);
}

#[test]
fn test_snapshot_restores_height_on_error() {
    fn push_then_fail(lua: &Lua) -> ferrolua::Result<()> {
        let stack = lua.stack()?;
        let _snapshot = stack.snapshot()?;
        stack.push(true)?;
        stack.push(3.5)?;
        lua.execute("error('fails midway')")?;
        Ok(())
    }

    let lua = Lua::new().unwrap();
    let before = lua.stack().unwrap().count().unwrap();
    assert!(push_then_fail(&lua).is_err());
    assert_eq!(lua.stack().unwrap().count().unwrap(), before);
}

#[test]
fn test_capture_from_stack() {
    let lua = Lua::new().unwrap();
    let stack = lua.stack().unwrap();
    let _snapshot = stack.snapshot().unwrap();

    let table = lua.create_table().unwrap();
    table.set(1, "first").unwrap();
    stack.push(&table).unwrap();

    let captured = stack.capture(-1).unwrap();
    assert_eq!(captured.value_type().unwrap(), ValueType::Table);
    assert_eq!(&captured, table.reference());

    stack.push(42).unwrap();
    assert!(matches!(stack.capture(-1), Err(LuaError::InvalidValue(_))));
}

#[test]
fn test_references_rejected_after_close() {
    let lua = Lua::new().unwrap();
    let table = lua.create_table().unwrap();
    lua.close().unwrap();

    assert!(lua.is_closed());
    assert!(table.is_disposed());
    assert!(matches!(table.get::<_, Value>("x"), Err(LuaError::ObjectDisposed(_))));
    assert!(matches!(lua.create_table(), Err(LuaError::ObjectDisposed(_))));
}
