//! core-keytable: binding resolution and key-event command translation.
//!
//! Drivers deposit `(group, number, pressed)` edges; this crate resolves
//! them against an immutable [`KeyTableDef`] (contexts, bindings, hotkeys,
//! mapped keys) and emits commands, honoring sticky modifiers, long press,
//! autorepeat, and autorelease.

mod binding;
mod engine;
mod keys;
mod runtime;

pub use binding::{
    BindingFlags, ContextId, Hotkey, KeyBinding, KeyCombination, KeyContext, KeyTableBuilder,
    KeyTableDef, KeyboardFunction, MappedKey,
};
pub use engine::{KeyEffect, KeyTable, KeyTableTimings};
pub use keys::{ANY_NUMBER, KeyValue, group};
pub use runtime::KeyTableRuntime;
