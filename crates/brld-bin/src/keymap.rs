//! Built-in key table for the generic display protocol.
//!
//! Drivers normally install their own tables; this one covers the generic
//! serial protocol's navigation bank, routing row, and braille keyboard so
//! an unconfigured display is usable out of the box.

use std::rc::Rc;

use core_commands::{Command, basic, block};
use core_keytable::{
    BindingFlags, Hotkey, KeyBinding, KeyCombination, KeyTableDef, KeyValue, KeyboardFunction,
    MappedKey, group,
};

fn nav(n: u16) -> KeyValue {
    KeyValue::new(group::NAV, n)
}

pub fn default_key_table() -> Rc<KeyTableDef> {
    let mut builder = KeyTableDef::builder();
    let default = builder.context("default", None);
    let panning = builder.context("panning", Some(default));

    // Primary navigation: line keys repeat while held.
    builder.bind(
        default,
        KeyBinding::new(KeyCombination::solo(nav(1)), Command::basic(basic::LNUP))
            .with_flags(BindingFlags::LONG_PRESS | BindingFlags::AUTOREPEAT),
    );
    builder.bind(
        default,
        KeyBinding::new(KeyCombination::solo(nav(2)), Command::basic(basic::LNDN))
            .with_flags(BindingFlags::LONG_PRESS | BindingFlags::AUTOREPEAT),
    );
    builder.bind(
        default,
        KeyBinding::new(KeyCombination::solo(nav(3)), Command::basic(basic::FWINLT))
            .with_flags(BindingFlags::LONG_PRESS | BindingFlags::AUTOREPEAT),
    );
    builder.bind(
        default,
        KeyBinding::new(KeyCombination::solo(nav(4)), Command::basic(basic::FWINRT))
            .with_flags(BindingFlags::LONG_PRESS | BindingFlags::AUTOREPEAT),
    );

    // Chords on the two line keys.
    builder.bind(
        default,
        KeyBinding::new(
            KeyCombination::chord(&[nav(1)], nav(2)),
            Command::basic(basic::HOME),
        )
        .on_release(Command::basic(basic::RETURN)),
    );
    builder.bind(
        default,
        KeyBinding::new(
            KeyCombination::chord(&[nav(3)], nav(1)),
            Command::basic(basic::TOP),
        ),
    );
    builder.bind(
        default,
        KeyBinding::new(
            KeyCombination::chord(&[nav(3)], nav(2)),
            Command::basic(basic::BOT),
        ),
    );

    // Held pan keys switch into the panning context for the next command.
    builder.bind(
        default,
        KeyBinding::new(
            KeyCombination::held(&[nav(3), nav(4)]),
            Command::new(block::CONTEXT, panning.0 as u32),
        ),
    );
    builder.bind(
        panning,
        KeyBinding::new(KeyCombination::solo(nav(1)), Command::basic(basic::TOP)),
    );
    builder.bind(
        panning,
        KeyBinding::new(KeyCombination::solo(nav(2)), Command::basic(basic::BOT)),
    );

    // Routing keys address their own column.
    builder.bind(
        default,
        KeyBinding::new(
            KeyCombination::solo(KeyValue::any(group::ROUTING)),
            Command::route(0),
        ),
    );

    // Freeze toggle behaves as a hotkey: both edges matter.
    builder.hotkey(
        default,
        Hotkey {
            key: nav(7),
            on_press: Some(Command::basic(basic::FREEZE)),
            on_release: None,
        },
    );

    // The braille keyboard: dot keys accumulate into one keyboard event.
    let dot_functions = [
        KeyboardFunction::DOT_1,
        KeyboardFunction::DOT_2,
        KeyboardFunction::DOT_3,
        KeyboardFunction::DOT_4,
        KeyboardFunction::DOT_5,
        KeyboardFunction::DOT_6,
        KeyboardFunction::DOT_7,
        KeyboardFunction::DOT_8,
    ];
    for (index, function) in dot_functions.into_iter().enumerate() {
        builder.map_key(
            default,
            MappedKey {
                key: KeyValue::new(group::DOTS, index as u16),
                function,
            },
        );
    }
    builder.map_key(
        default,
        MappedKey {
            key: KeyValue::new(group::DOTS, 8),
            function: KeyboardFunction::SPACE,
        },
    );

    builder.default_context(default);
    Rc::new(builder.build())
}
