//! Binding, hotkey, and context definitions.
//!
//! A key table is an ordered collection of named contexts. Each context holds
//! bindings (combination → command), hotkeys (single-key press/release
//! commands independent of combinations), and mapped keys (held keys that
//! accumulate into a virtual keyboard function mask). Contexts chain to a
//! parent so a device table can override just a few bindings of the default
//! context. Definitions are immutable after construction and shared by
//! reference across sessions.

use bitflags::bitflags;
use core_commands::Command;
use smallvec::SmallVec;

use crate::keys::KeyValue;

/// Index of a context within its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub usize);

bitflags! {
    /// Per-binding behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BindingFlags: u8 {
        /// Re-dispatch with the LONG_PRESS command flag when held past the
        /// long-press time.
        const LONG_PRESS = 1 << 0;
        /// After a long press, keep re-dispatching at the autorepeat
        /// interval until release.
        const AUTOREPEAT = 1 << 1;
        /// For context-switch commands: change the default context rather
        /// than just the next command's context.
        const PERSISTENT_CONTEXT = 1 << 2;
    }
}

/// Modifiers held simultaneously plus an optional immediate key whose press
/// edge triggers the binding. With no immediate key the binding fires when
/// the last modifier of the combination goes down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCombination {
    modifiers: SmallVec<[KeyValue; 4]>,
    immediate: Option<KeyValue>,
}

impl KeyCombination {
    pub fn new(mut modifiers: SmallVec<[KeyValue; 4]>, immediate: Option<KeyValue>) -> Self {
        modifiers.sort_unstable();
        Self {
            modifiers,
            immediate,
        }
    }

    pub fn chord(modifiers: &[KeyValue], immediate: KeyValue) -> Self {
        Self::new(SmallVec::from_slice(modifiers), Some(immediate))
    }

    pub fn solo(key: KeyValue) -> Self {
        Self::new(SmallVec::new(), Some(key))
    }

    /// All modifiers pressed together, no trigger key.
    pub fn held(modifiers: &[KeyValue]) -> Self {
        Self::new(SmallVec::from_slice(modifiers), None)
    }

    pub fn modifier_count(&self) -> usize {
        self.modifiers.len()
    }

    pub fn immediate(&self) -> Option<KeyValue> {
        self.immediate
    }

    /// Match a just-pressed `key` against this combination given the other
    /// currently held keys (`held`, sorted, excluding `key`).
    pub fn matches_press(&self, held: &[KeyValue], key: KeyValue) -> bool {
        match self.immediate {
            Some(immediate) => {
                immediate.matches(key) && same_key_set(&self.modifiers, held)
            }
            None => {
                // The new key completes the modifier set.
                if !self.modifiers.iter().any(|m| m.matches(key)) {
                    return false;
                }
                let mut full: SmallVec<[KeyValue; 4]> = SmallVec::from_slice(held);
                full.push(key);
                full.sort_unstable();
                same_key_set(&self.modifiers, &full)
            }
        }
    }

    /// Whether `key` participates in this combination.
    pub fn involves(&self, key: KeyValue) -> bool {
        self.modifiers.iter().any(|m| m.matches(key))
            || self.immediate.is_some_and(|i| i.matches(key))
    }
}

fn same_key_set(pattern: &[KeyValue], keys: &[KeyValue]) -> bool {
    pattern.len() == keys.len() && pattern.iter().zip(keys).all(|(p, k)| p.matches(*k))
}

#[derive(Debug, Clone)]
pub struct KeyBinding {
    pub combination: KeyCombination,
    /// Fires on the press edge.
    pub primary: Command,
    /// Fires on release of the combination when defined.
    pub secondary: Option<Command>,
    pub flags: BindingFlags,
}

impl KeyBinding {
    pub fn new(combination: KeyCombination, primary: Command) -> Self {
        Self {
            combination,
            primary,
            secondary: None,
            flags: BindingFlags::empty(),
        }
    }

    #[must_use]
    pub fn on_release(mut self, secondary: Command) -> Self {
        self.secondary = Some(secondary);
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: BindingFlags) -> Self {
        self.flags |= flags;
        self
    }
}

/// Immediate per-key commands that bypass combination matching.
#[derive(Debug, Clone)]
pub struct Hotkey {
    pub key: KeyValue,
    pub on_press: Option<Command>,
    pub on_release: Option<Command>,
}

bitflags! {
    /// Virtual keyboard function bits accumulated by mapped keys.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyboardFunction: u16 {
        const DOT_1 = 1 << 0;
        const DOT_2 = 1 << 1;
        const DOT_3 = 1 << 2;
        const DOT_4 = 1 << 3;
        const DOT_5 = 1 << 4;
        const DOT_6 = 1 << 5;
        const DOT_7 = 1 << 6;
        const DOT_8 = 1 << 7;
        const SPACE = 1 << 8;
        const SHIFT = 1 << 9;
        const CONTROL = 1 << 10;
    }
}

/// A held key contributing bits to the keyboard-function accumulator.
#[derive(Debug, Clone)]
pub struct MappedKey {
    pub key: KeyValue,
    pub function: KeyboardFunction,
}

/// A named binding scope.
#[derive(Debug, Clone)]
pub struct KeyContext {
    pub name: String,
    bindings: Vec<KeyBinding>,
    hotkeys: Vec<Hotkey>,
    mapped: Vec<MappedKey>,
    parent: Option<ContextId>,
}

impl KeyContext {
    pub fn bindings(&self) -> &[KeyBinding] {
        &self.bindings
    }

    pub fn hotkeys(&self) -> &[Hotkey] {
        &self.hotkeys
    }

    pub fn mapped_keys(&self) -> &[MappedKey] {
        &self.mapped
    }

    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }
}

/// Immutable key table definition: contexts plus the default context id.
#[derive(Debug)]
pub struct KeyTableDef {
    contexts: Vec<KeyContext>,
    default_context: ContextId,
}

impl KeyTableDef {
    pub fn builder() -> KeyTableBuilder {
        KeyTableBuilder::default()
    }

    pub fn context(&self, id: ContextId) -> Option<&KeyContext> {
        self.contexts.get(id.0)
    }

    pub fn default_context(&self) -> ContextId {
        self.default_context
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }
}

#[derive(Default)]
pub struct KeyTableBuilder {
    contexts: Vec<KeyContext>,
    default_context: Option<ContextId>,
}

impl KeyTableBuilder {
    /// Open a new context; returns its id for parenting and switching.
    pub fn context(&mut self, name: impl Into<String>, parent: Option<ContextId>) -> ContextId {
        let id = ContextId(self.contexts.len());
        self.contexts.push(KeyContext {
            name: name.into(),
            bindings: Vec::new(),
            hotkeys: Vec::new(),
            mapped: Vec::new(),
            parent,
        });
        id
    }

    pub fn bind(&mut self, ctx: ContextId, binding: KeyBinding) -> &mut Self {
        self.contexts[ctx.0].bindings.push(binding);
        self
    }

    pub fn hotkey(&mut self, ctx: ContextId, hotkey: Hotkey) -> &mut Self {
        self.contexts[ctx.0].hotkeys.push(hotkey);
        self
    }

    pub fn map_key(&mut self, ctx: ContextId, mapped: MappedKey) -> &mut Self {
        self.contexts[ctx.0].mapped.push(mapped);
        self
    }

    pub fn default_context(&mut self, ctx: ContextId) -> &mut Self {
        self.default_context = Some(ctx);
        self
    }

    /// Finish the table. Bindings are stably sorted so combinations with
    /// more modifiers are tried first; definition order decides ties.
    pub fn build(mut self) -> KeyTableDef {
        for ctx in &mut self.contexts {
            ctx.bindings
                .sort_by_key(|b| std::cmp::Reverse(b.combination.modifier_count()));
        }
        let default_context = self.default_context.unwrap_or(ContextId(0));
        KeyTableDef {
            contexts: self.contexts,
            default_context,
        }
    }
}
