//! Key event processing.
//!
//! `KeyTable` is the pure state machine: ordered pressed-key set, binding
//! resolution across the context chain, hotkeys, mapped keys, sticky
//! modifiers, and the firing bookkeeping for release commands, long press,
//! autorepeat, and autorelease. It owns no timers; every call returns the
//! [`KeyEffect`]s the caller must apply, and timer expiry is fed back in
//! through the `*_fired` methods. The scheduler-backed wrapper lives in
//! `runtime`.

use core_commands::{Command, CommandFlags, block};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::binding::{BindingFlags, ContextId, KeyBinding, KeyTableDef, KeyboardFunction};
use crate::keys::KeyValue;

use std::rc::Rc;
use std::time::Duration;

/// Timer configuration for one key table.
#[derive(Debug, Clone, Copy)]
pub struct KeyTableTimings {
    pub long_press: Duration,
    pub autorepeat_interval: Duration,
    pub autorelease: Duration,
    pub sticky_modifiers: Duration,
}

impl Default for KeyTableTimings {
    fn default() -> Self {
        Self {
            long_press: Duration::from_millis(300),
            autorepeat_interval: Duration::from_millis(100),
            autorelease: Duration::from_secs(20),
            sticky_modifiers: Duration::from_secs(5),
        }
    }
}

/// Side effects the caller must apply after feeding the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEffect {
    /// Dispatch a command through the command queue.
    Dispatch(Command),
    /// All mapped keys released: synthesize one keyboard event to the
    /// console with the accumulated function bits.
    KeyboardEvent(KeyboardFunction),
    /// Arm (or re-arm) the long-press timer for this command.
    ArmLongPress(Command),
    CancelLongPress,
    /// Begin periodic re-dispatch of this command.
    ArmAutorepeat(Command),
    CancelAutorepeat,
    ResetAutorelease,
    CancelAutorelease,
    ArmStickyTimeout,
    CancelStickyTimeout,
    /// No binding, hotkey, or mapped key consumed the press.
    Unbound(KeyValue),
}

type Effects = SmallVec<[KeyEffect; 4]>;

struct FiringState {
    /// Keys that made up the combination when it fired.
    keys: SmallVec<[KeyValue; 4]>,
    secondary: Option<Command>,
    long_press: Command,
    long_press_armed: bool,
    autorepeat: bool,
}

pub struct KeyTable {
    def: Rc<KeyTableDef>,
    timings: KeyTableTimings,
    pressed: Vec<KeyValue>,
    persistent_context: ContextId,
    temporary_context: Option<ContextId>,
    firing: Option<FiringState>,
    sticky_on: CommandFlags,
    sticky_next: CommandFlags,
    keyboard_live: KeyboardFunction,
    keyboard_pending: KeyboardFunction,
}

impl KeyTable {
    pub fn new(def: Rc<KeyTableDef>, timings: KeyTableTimings) -> Self {
        let persistent_context = def.default_context();
        Self {
            def,
            timings,
            pressed: Vec::new(),
            persistent_context,
            temporary_context: None,
            firing: None,
            sticky_on: CommandFlags::empty(),
            sticky_next: CommandFlags::empty(),
            keyboard_live: KeyboardFunction::empty(),
            keyboard_pending: KeyboardFunction::empty(),
        }
    }

    pub fn timings(&self) -> KeyTableTimings {
        self.timings
    }

    pub fn pressed_keys(&self) -> &[KeyValue] {
        &self.pressed
    }

    pub fn active_context(&self) -> ContextId {
        self.temporary_context.unwrap_or(self.persistent_context)
    }

    /// Process one press/release edge from the driver.
    pub fn process_key_event(&mut self, key: KeyValue, pressed: bool) -> Effects {
        if pressed {
            self.process_press(key)
        } else {
            self.process_release(key)
        }
    }

    fn process_press(&mut self, key: KeyValue) -> Effects {
        let mut effects = Effects::new();
        if self.pressed.contains(&key) {
            // The firing mark means a combination already consumed this
            // press; either way a duplicate never refires.
            warn!(target: "keytable", ?key, "duplicate_press_dropped");
            return effects;
        }
        self.pressed.push(key);
        effects.push(KeyEffect::CancelLongPress);
        effects.push(KeyEffect::CancelAutorepeat);
        effects.push(KeyEffect::ResetAutorelease);
        self.clear_long_press_mark();

        let held: SmallVec<[KeyValue; 4]> = {
            let mut held: SmallVec<[KeyValue; 4]> = self
                .pressed
                .iter()
                .copied()
                .filter(|k| *k != key)
                .collect();
            held.sort_unstable();
            held
        };

        if let Some((ctx, binding)) = self.find_binding(&held, key) {
            let combination = binding.combination.clone();
            let primary = binding.primary;
            let secondary = binding.secondary;
            let flags = binding.flags;
            trace!(target: "keytable", ?key, context = ctx.0, "binding_matched");

            if primary.block() == block::CONTEXT {
                let target = ContextId(primary.operand() as usize);
                if target.0 < self.def.context_count() {
                    if flags.contains(BindingFlags::PERSISTENT_CONTEXT) {
                        self.persistent_context = target;
                        self.temporary_context = None;
                    } else {
                        self.temporary_context = Some(target);
                    }
                    debug!(target: "keytable", context = target.0,
                           persistent = flags.contains(BindingFlags::PERSISTENT_CONTEXT),
                           "context_switch");
                } else {
                    warn!(target: "keytable", context = target.0, "context_switch_out_of_range");
                }
                self.firing = Some(FiringState {
                    keys: self.pressed.iter().copied().collect(),
                    secondary: None,
                    long_press: primary,
                    long_press_armed: false,
                    autorepeat: false,
                });
                return effects;
            }

            // A command leaving a temporary context reverts it.
            self.temporary_context = None;
            let command = self.stamp(primary, &mut effects);
            self.firing = Some(FiringState {
                keys: self.pressed.iter().copied().collect(),
                secondary,
                long_press: command,
                long_press_armed: flags.contains(BindingFlags::LONG_PRESS),
                autorepeat: flags.contains(BindingFlags::AUTOREPEAT),
            });
            // Routing-style wildcards forward the key number as operand.
            let command = if combination
                .immediate()
                .is_some_and(|i| i.is_wildcard())
            {
                command.with_operand(key.number as u32)
            } else {
                command
            };
            if let Some(firing) = &mut self.firing {
                firing.long_press = command;
            }
            effects.push(KeyEffect::Dispatch(command));
            if flags.contains(BindingFlags::LONG_PRESS) {
                effects.push(KeyEffect::ArmLongPress(command));
            }
            return effects;
        }

        if let Some(command) = self.find_hotkey(key, true) {
            let command = self.stamp(command, &mut effects);
            effects.push(KeyEffect::Dispatch(command));
            return effects;
        }

        if let Some(function) = self.find_mapped(key) {
            self.keyboard_live |= function;
            self.keyboard_pending |= function;
            trace!(target: "keytable", ?key, ?function, "mapped_key_down");
            return effects;
        }

        debug!(target: "keytable", ?key, "press_unbound");
        effects.push(KeyEffect::Unbound(key));
        effects
    }

    fn process_release(&mut self, key: KeyValue) -> Effects {
        let mut effects = Effects::new();
        let Some(position) = self.pressed.iter().position(|k| *k == key) else {
            warn!(target: "keytable", ?key, "spurious_release_dropped");
            return effects;
        };
        self.pressed.remove(position);
        effects.push(KeyEffect::CancelLongPress);
        effects.push(KeyEffect::CancelAutorepeat);
        if self.pressed.is_empty() {
            effects.push(KeyEffect::CancelAutorelease);
        } else {
            effects.push(KeyEffect::ResetAutorelease);
        }

        let combination_released = self
            .firing
            .as_ref()
            .is_some_and(|f| f.keys.contains(&key));
        if combination_released {
            if let Some(secondary) = self.firing.take().and_then(|f| f.secondary) {
                let secondary = self.stamp(secondary, &mut effects);
                effects.push(KeyEffect::Dispatch(secondary));
            }
        }

        if let Some(function) = self.find_mapped(key) {
            self.keyboard_live &= !function;
            if self.keyboard_live.is_empty() && !self.keyboard_pending.is_empty() {
                let event = self.keyboard_pending;
                self.keyboard_pending = KeyboardFunction::empty();
                trace!(target: "keytable", ?event, "keyboard_event");
                effects.push(KeyEffect::KeyboardEvent(event));
            }
        } else if let Some(command) = self.find_hotkey(key, false) {
            let command = self.stamp(command, &mut effects);
            effects.push(KeyEffect::Dispatch(command));
        }

        effects
    }

    /// The long-press timer expired while the combination was still held.
    pub fn long_press_fired(&mut self) -> Effects {
        let mut effects = Effects::new();
        let Some(firing) = &mut self.firing else {
            return effects;
        };
        if !firing.long_press_armed {
            return effects;
        }
        firing.long_press_armed = false;
        let command = firing.long_press.with_flags(CommandFlags::LONG_PRESS);
        let autorepeat = firing.autorepeat;
        debug!(target: "keytable", command = command.name(), autorepeat, "long_press");
        effects.push(KeyEffect::Dispatch(command));
        if autorepeat {
            effects.push(KeyEffect::ArmAutorepeat(firing.long_press));
        }
        effects
    }

    /// One autorepeat tick; the runtime re-arms periodically.
    pub fn autorepeat_fired(&mut self) -> Effects {
        let mut effects = Effects::new();
        if let Some(firing) = &self.firing {
            if firing.autorepeat {
                effects.push(KeyEffect::Dispatch(firing.long_press));
            }
        }
        effects
    }

    /// The autorelease timer expired: every held key gets a synthesized
    /// release, newest first, so stuck hardware cannot wedge the table.
    pub fn autorelease_fired(&mut self) -> Effects {
        let mut effects = Effects::new();
        if self.pressed.is_empty() {
            return effects;
        }
        warn!(target: "keytable", held = self.pressed.len(), "autorelease");
        let keys: Vec<KeyValue> = self.pressed.iter().rev().copied().collect();
        for key in keys {
            effects.extend(self.process_release(key));
        }
        effects
    }

    /// Sticky-modifier timeout: both vectors clear.
    pub fn sticky_timeout_fired(&mut self) {
        if !self.sticky_on.is_empty() || !self.sticky_next.is_empty() {
            debug!(target: "keytable", "sticky_modifiers_expired");
        }
        self.sticky_on = CommandFlags::empty();
        self.sticky_next = CommandFlags::empty();
    }

    /// Latch a modifier: `persistent` keeps it for every command, otherwise
    /// it applies to the next command only.
    pub fn add_sticky_modifier(&mut self, flag: CommandFlags, persistent: bool) -> Effects {
        if persistent {
            self.sticky_on |= flag;
        } else {
            self.sticky_next |= flag;
        }
        debug!(target: "keytable", ?flag, persistent, "sticky_modifier_set");
        let mut effects = Effects::new();
        effects.push(KeyEffect::ArmStickyTimeout);
        effects
    }

    pub fn sticky_modifiers(&self) -> (CommandFlags, CommandFlags) {
        (self.sticky_on, self.sticky_next)
    }

    fn clear_long_press_mark(&mut self) {
        if let Some(firing) = &mut self.firing {
            firing.long_press_armed = false;
            firing.autorepeat = false;
        }
    }

    /// Apply sticky modifiers to a command about to fire.
    fn stamp(&mut self, command: Command, effects: &mut Effects) -> Command {
        let extra = self.sticky_on | self.sticky_next;
        if !self.sticky_next.is_empty() {
            self.sticky_next = CommandFlags::empty();
        }
        if !extra.is_empty() {
            effects.push(KeyEffect::CancelStickyTimeout);
        }
        command.with_flags(extra)
    }

    fn find_binding(&self, held: &[KeyValue], key: KeyValue) -> Option<(ContextId, KeyBinding)> {
        let mut next = Some(self.active_context());
        let mut visited = 0;
        while let Some(ctx_id) = next {
            let ctx = self.def.context(ctx_id)?;
            for binding in ctx.bindings() {
                if binding.combination.matches_press(held, key) {
                    return Some((ctx_id, binding.clone()));
                }
            }
            next = ctx.parent();
            visited += 1;
            if visited > self.def.context_count() {
                warn!(target: "keytable", "context_parent_cycle");
                return None;
            }
        }
        None
    }

    fn find_hotkey(&self, key: KeyValue, press: bool) -> Option<Command> {
        let mut next = Some(self.active_context());
        let mut visited = 0;
        while let Some(ctx_id) = next {
            let ctx = self.def.context(ctx_id)?;
            for hotkey in ctx.hotkeys() {
                if hotkey.key.matches(key) {
                    return if press {
                        hotkey.on_press
                    } else {
                        hotkey.on_release
                    };
                }
            }
            next = ctx.parent();
            visited += 1;
            if visited > self.def.context_count() {
                return None;
            }
        }
        None
    }

    fn find_mapped(&self, key: KeyValue) -> Option<KeyboardFunction> {
        let mut next = Some(self.active_context());
        let mut visited = 0;
        while let Some(ctx_id) = next {
            let ctx = self.def.context(ctx_id)?;
            for mapped in ctx.mapped_keys() {
                if mapped.key.matches(key) {
                    return Some(mapped.function);
                }
            }
            next = ctx.parent();
            visited += 1;
            if visited > self.def.context_count() {
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{Hotkey, KeyBinding, KeyCombination, KeyTableDef, MappedKey};
    use crate::keys::{KeyValue, group};
    use core_commands::basic;
    use pretty_assertions::assert_eq;

    fn nav(n: u16) -> KeyValue {
        KeyValue::new(group::NAV, n)
    }

    fn dispatched(effects: &[KeyEffect]) -> Vec<Command> {
        effects
            .iter()
            .filter_map(|e| match e {
                KeyEffect::Dispatch(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    fn simple_table() -> Rc<KeyTableDef> {
        let mut builder = KeyTableDef::builder();
        let default = builder.context("default", None);
        builder.bind(
            default,
            KeyBinding::new(KeyCombination::solo(nav(1)), Command::basic(basic::LNUP)),
        );
        builder.bind(
            default,
            KeyBinding::new(KeyCombination::solo(nav(2)), Command::basic(basic::LNDN))
                .with_flags(BindingFlags::LONG_PRESS | BindingFlags::AUTOREPEAT),
        );
        builder.bind(
            default,
            KeyBinding::new(
                KeyCombination::chord(&[nav(3)], nav(1)),
                Command::basic(basic::TOP),
            )
            .on_release(Command::basic(basic::BOT)),
        );
        builder.bind(
            default,
            KeyBinding::new(
                KeyCombination::solo(KeyValue::any(group::ROUTING)),
                Command::route(0),
            ),
        );
        builder.default_context(default);
        Rc::new(builder.build())
    }

    fn table() -> KeyTable {
        KeyTable::new(simple_table(), KeyTableTimings::default())
    }

    #[test]
    fn pressed_set_tracks_press_and_release_counts() {
        let mut t = table();
        t.process_key_event(nav(1), true);
        t.process_key_event(nav(3), true);
        assert_eq!(t.pressed_keys().len(), 2);
        t.process_key_event(nav(1), false);
        t.process_key_event(nav(3), false);
        assert_eq!(t.pressed_keys().len(), 0);
    }

    #[test]
    fn duplicate_press_is_rejected_and_does_not_refire() {
        let mut t = table();
        let first = t.process_key_event(nav(1), true);
        assert_eq!(dispatched(&first), vec![Command::basic(basic::LNUP)]);
        let second = t.process_key_event(nav(1), true);
        assert_eq!(dispatched(&second), vec![]);
        assert_eq!(t.pressed_keys().len(), 1);
    }

    #[test]
    fn spurious_release_is_dropped() {
        let mut t = table();
        let effects = t.process_key_event(nav(7), false);
        assert!(effects.is_empty());
    }

    #[test]
    fn chord_beats_solo_binding_on_same_immediate_key() {
        let mut t = table();
        t.process_key_event(nav(3), true);
        let effects = t.process_key_event(nav(1), true);
        assert_eq!(dispatched(&effects), vec![Command::basic(basic::TOP)]);
    }

    #[test]
    fn secondary_command_fires_on_release_of_the_combination() {
        let mut t = table();
        t.process_key_event(nav(3), true);
        t.process_key_event(nav(1), true);
        let release = t.process_key_event(nav(1), false);
        assert_eq!(dispatched(&release), vec![Command::basic(basic::BOT)]);
        // The other combination key releases silently.
        let rest = t.process_key_event(nav(3), false);
        assert_eq!(dispatched(&rest), vec![]);
    }

    #[test]
    fn wildcard_routing_key_carries_its_column_as_operand() {
        let mut t = table();
        let effects = t.process_key_event(KeyValue::new(group::ROUTING, 17), true);
        assert_eq!(dispatched(&effects), vec![Command::route(17)]);
    }

    #[test]
    fn sticky_next_modifier_applies_once_then_clears() {
        let mut t = table();
        t.add_sticky_modifier(CommandFlags::SHIFT, false);
        let first = t.process_key_event(nav(1), true);
        assert_eq!(
            dispatched(&first),
            vec![Command::basic(basic::LNUP).with_flags(CommandFlags::SHIFT)]
        );
        t.process_key_event(nav(1), false);
        let second = t.process_key_event(nav(1), true);
        assert_eq!(dispatched(&second), vec![Command::basic(basic::LNUP)]);
    }

    #[test]
    fn sticky_persistent_modifier_applies_until_timeout() {
        let mut t = table();
        t.add_sticky_modifier(CommandFlags::CONTROL, true);
        for _ in 0..2 {
            let effects = t.process_key_event(nav(1), true);
            assert_eq!(
                dispatched(&effects),
                vec![Command::basic(basic::LNUP).with_flags(CommandFlags::CONTROL)]
            );
            t.process_key_event(nav(1), false);
        }
        t.sticky_timeout_fired();
        let effects = t.process_key_event(nav(1), true);
        assert_eq!(dispatched(&effects), vec![Command::basic(basic::LNUP)]);
    }

    #[test]
    fn long_press_redispatches_with_flag_then_autorepeats() {
        let mut t = table();
        let press = t.process_key_event(nav(2), true);
        assert_eq!(dispatched(&press), vec![Command::basic(basic::LNDN)]);
        assert!(press.contains(&KeyEffect::ArmLongPress(Command::basic(basic::LNDN))));

        let long = t.long_press_fired();
        assert_eq!(
            dispatched(&long),
            vec![Command::basic(basic::LNDN).with_flags(CommandFlags::LONG_PRESS)]
        );
        assert!(long.contains(&KeyEffect::ArmAutorepeat(Command::basic(basic::LNDN))));

        let tick = t.autorepeat_fired();
        assert_eq!(dispatched(&tick), vec![Command::basic(basic::LNDN)]);

        // Release stops everything.
        let release = t.process_key_event(nav(2), false);
        assert!(release.contains(&KeyEffect::CancelAutorepeat));
        assert!(t.autorepeat_fired().is_empty());
        assert!(t.long_press_fired().is_empty());
    }

    #[test]
    fn any_key_change_cancels_a_pending_long_press() {
        let mut t = table();
        t.process_key_event(nav(2), true);
        let other = t.process_key_event(nav(3), true);
        assert!(other.contains(&KeyEffect::CancelLongPress));
        assert!(t.long_press_fired().is_empty());
    }

    #[test]
    fn autorelease_releases_every_key_in_reverse_order() {
        let mut t = table();
        t.process_key_event(nav(1), true);
        t.process_key_event(nav(3), true);
        let effects = t.autorelease_fired();
        assert_eq!(t.pressed_keys().len(), 0);
        assert!(effects.contains(&KeyEffect::CancelAutorelease));
    }

    #[test]
    fn hotkeys_fire_on_press_and_release_edges() {
        let mut builder = KeyTableDef::builder();
        let ctx = builder.context("default", None);
        builder.hotkey(
            ctx,
            Hotkey {
                key: nav(5),
                on_press: Some(Command::basic(basic::FREEZE)),
                on_release: Some(Command::basic(basic::REFRESH)),
            },
        );
        builder.default_context(ctx);
        let mut t = KeyTable::new(Rc::new(builder.build()), KeyTableTimings::default());
        let press = t.process_key_event(nav(5), true);
        assert_eq!(dispatched(&press), vec![Command::basic(basic::FREEZE)]);
        let release = t.process_key_event(nav(5), false);
        assert_eq!(dispatched(&release), vec![Command::basic(basic::REFRESH)]);
    }

    #[test]
    fn mapped_keys_accumulate_and_emit_on_full_release() {
        let mut builder = KeyTableDef::builder();
        let ctx = builder.context("default", None);
        builder.map_key(
            ctx,
            MappedKey {
                key: KeyValue::new(group::DOTS, 1),
                function: KeyboardFunction::DOT_1,
            },
        );
        builder.map_key(
            ctx,
            MappedKey {
                key: KeyValue::new(group::DOTS, 4),
                function: KeyboardFunction::DOT_4,
            },
        );
        builder.default_context(ctx);
        let mut t = KeyTable::new(Rc::new(builder.build()), KeyTableTimings::default());
        t.process_key_event(KeyValue::new(group::DOTS, 1), true);
        t.process_key_event(KeyValue::new(group::DOTS, 4), true);
        let partial = t.process_key_event(KeyValue::new(group::DOTS, 1), false);
        assert!(!partial.iter().any(|e| matches!(e, KeyEffect::KeyboardEvent(_))));
        let done = t.process_key_event(KeyValue::new(group::DOTS, 4), false);
        assert!(done.contains(&KeyEffect::KeyboardEvent(
            KeyboardFunction::DOT_1 | KeyboardFunction::DOT_4
        )));
    }

    #[test]
    fn temporary_context_reverts_after_one_command() {
        let mut builder = KeyTableDef::builder();
        let default = builder.context("default", None);
        let alt = builder.context("alternate", Some(default));
        builder.bind(
            default,
            KeyBinding::new(
                KeyCombination::solo(nav(9)),
                Command::new(block::CONTEXT, alt.0 as u32),
            ),
        );
        builder.bind(
            default,
            KeyBinding::new(KeyCombination::solo(nav(1)), Command::basic(basic::LNUP)),
        );
        builder.bind(
            alt,
            KeyBinding::new(KeyCombination::solo(nav(1)), Command::basic(basic::TOP)),
        );
        builder.default_context(default);
        let mut t = KeyTable::new(Rc::new(builder.build()), KeyTableTimings::default());

        t.process_key_event(nav(9), true);
        t.process_key_event(nav(9), false);
        assert_eq!(t.active_context(), alt);

        let effects = t.process_key_event(nav(1), true);
        assert_eq!(dispatched(&effects), vec![Command::basic(basic::TOP)]);
        t.process_key_event(nav(1), false);
        assert_eq!(t.active_context(), default);

        let effects = t.process_key_event(nav(1), true);
        assert_eq!(dispatched(&effects), vec![Command::basic(basic::LNUP)]);
    }
}
