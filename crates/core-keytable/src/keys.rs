//! Key identities.
//!
//! A `KeyValue` names one physical key as `(group, number)`: the group is a
//! logical bank (braille dot keys, routing keys, device navigation keys) and
//! the number is the in-bank index. `ANY_NUMBER` is the wildcard used by
//! bindings that accept any key of a group, typically routing keys whose
//! column becomes the command operand.

use std::fmt;

/// Wildcard key number matching every key of its group.
pub const ANY_NUMBER: u16 = 0xFFFF;

/// Well-known key groups. Drivers may define further groups above `DRIVER`.
pub mod group {
    /// Braille dot and thumb keys.
    pub const DOTS: u8 = 0;
    /// Per-cell routing keys.
    pub const ROUTING: u8 = 1;
    /// Device-specific navigation keys.
    pub const NAV: u8 = 2;
    /// First group free for driver-private banks.
    pub const DRIVER: u8 = 8;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyValue {
    pub group: u8,
    pub number: u16,
}

impl KeyValue {
    pub const fn new(group: u8, number: u16) -> Self {
        Self { group, number }
    }

    pub const fn any(group: u8) -> Self {
        Self {
            group,
            number: ANY_NUMBER,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.number == ANY_NUMBER
    }

    /// Wildcard-aware equality: a wildcard matches any number in its group.
    pub fn matches(&self, other: KeyValue) -> bool {
        self.group == other.group
            && (self.number == other.number
                || self.number == ANY_NUMBER
                || other.number == ANY_NUMBER)
    }
}

impl fmt::Debug for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            write!(f, "Key({}.*)", self.group)
        } else {
            write!(f, "Key({}.{})", self.group, self.number)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_any_number_in_its_group() {
        let any_routing = KeyValue::any(group::ROUTING);
        assert!(any_routing.matches(KeyValue::new(group::ROUTING, 12)));
        assert!(!any_routing.matches(KeyValue::new(group::DOTS, 12)));
    }

    #[test]
    fn concrete_keys_match_only_themselves() {
        let k = KeyValue::new(group::DOTS, 3);
        assert!(k.matches(KeyValue::new(group::DOTS, 3)));
        assert!(!k.matches(KeyValue::new(group::DOTS, 4)));
    }
}
