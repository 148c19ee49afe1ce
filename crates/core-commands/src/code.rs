//! Command code layout.
//!
//! A command is a 32-bit code plus a flag word. The code packs a block
//! selector into bits 28..=16 and a block-specific operand into bits 15..=0
//! (routing column, character code, symbolic key). Flag modifiers live in a
//! separate [`CommandFlags`] word; on the client wire the pair is transmitted
//! as one 64-bit key code with the flags in the upper half.

use bitflags::bitflags;
use std::fmt;

pub const OPERAND_MASK: u32 = 0x0000_FFFF;
pub const BLOCK_MASK: u32 = 0x1FFF_0000;
pub const BLOCK_SHIFT: u32 = 16;

bitflags! {
    /// Modifier bits attached to a dispatched command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandFlags: u32 {
        const SHIFT         = 1 << 0;
        const CONTROL       = 1 << 1;
        const META          = 1 << 2;
        const ALTGR         = 1 << 3;
        const GUI           = 1 << 4;
        /// Set when a long press re-dispatches the bound command.
        const LONG_PRESS    = 1 << 5;
        /// Motion should stop at the cursor rather than the window edge.
        const TOWARD_CURSOR = 1 << 6;
        /// Motion should skip blank windows.
        const SKIP_BLANK    = 1 << 7;
    }
}

/// Command blocks. The block selects behavior; the operand parameterizes it.
pub mod block {
    /// Basic navigation and control; operand is one of the `basic` numbers.
    pub const BASIC: u32 = 0;
    /// Route the screen cursor to a text column; operand is the column.
    pub const ROUTE: u32 = 1;
    /// Pass a character to the console; operand is the character code.
    pub const PASS_CHAR: u32 = 2;
    /// Pass a symbolic key to the console; operand is a `passkey` number.
    pub const PASS_KEY: u32 = 3;
    /// Pass a braille dot combination; operand is the dot mask.
    pub const PASS_DOTS: u32 = 4;
    /// Switch key-table context; operand is the context index.
    pub const CONTEXT: u32 = 5;
}

/// Operands of the `BASIC` block.
pub mod basic {
    pub const NOOP: u32 = 0;
    /// Previous line.
    pub const LNUP: u32 = 1;
    /// Next line.
    pub const LNDN: u32 = 2;
    /// Pan the braille window left.
    pub const FWINLT: u32 = 3;
    /// Pan the braille window right.
    pub const FWINRT: u32 = 4;
    /// Go to the beginning of the current line.
    pub const HOME: u32 = 5;
    /// Return to the cursor position.
    pub const RETURN: u32 = 6;
    /// Go to the top-left corner.
    pub const TOP: u32 = 7;
    /// Go to the bottom-left corner.
    pub const BOT: u32 = 8;
    /// Toggle cursor tracking.
    pub const CSRTRK: u32 = 9;
    /// Toggle the frozen screen snapshot.
    pub const FREEZE: u32 = 10;
    /// Refresh the display from the screen image.
    pub const REFRESH: u32 = 11;
    /// Stop the daemon.
    pub const QUIT: u32 = 12;

    pub fn name(operand: u32) -> &'static str {
        match operand {
            NOOP => "NOOP",
            LNUP => "LNUP",
            LNDN => "LNDN",
            FWINLT => "FWINLT",
            FWINRT => "FWINRT",
            HOME => "HOME",
            RETURN => "RETURN",
            TOP => "TOP",
            BOT => "BOT",
            CSRTRK => "CSRTRK",
            FREEZE => "FREEZE",
            REFRESH => "REFRESH",
            QUIT => "QUIT",
            _ => "UNKNOWN",
        }
    }
}

/// Operands of the `PASS_KEY` block.
pub mod passkey {
    pub const ENTER: u32 = 0;
    pub const TAB: u32 = 1;
    pub const BACKSPACE: u32 = 2;
    pub const ESCAPE: u32 = 3;
    pub const CURSOR_LEFT: u32 = 4;
    pub const CURSOR_RIGHT: u32 = 5;
    pub const CURSOR_UP: u32 = 6;
    pub const CURSOR_DOWN: u32 = 7;
    pub const PAGE_UP: u32 = 8;
    pub const PAGE_DOWN: u32 = 9;
    pub const HOME: u32 = 10;
    pub const END: u32 = 11;
    pub const INSERT: u32 = 12;
    pub const DELETE: u32 = 13;
    /// Function keys: `FUNCTION + n` for F1..Fn.
    pub const FUNCTION: u32 = 16;
}

/// A dispatched command: packed code plus modifier flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    code: u32,
    flags: CommandFlags,
}

impl Command {
    pub const fn new(block: u32, operand: u32) -> Self {
        Self {
            code: ((block << BLOCK_SHIFT) & BLOCK_MASK) | (operand & OPERAND_MASK),
            flags: CommandFlags::empty(),
        }
    }

    pub const fn basic(operand: u32) -> Self {
        Self::new(block::BASIC, operand)
    }

    pub const fn route(column: u32) -> Self {
        Self::new(block::ROUTE, column)
    }

    pub fn from_code(code: u32) -> Self {
        Self {
            code,
            flags: CommandFlags::empty(),
        }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn block(&self) -> u32 {
        (self.code & BLOCK_MASK) >> BLOCK_SHIFT
    }

    pub fn operand(&self) -> u32 {
        self.code & OPERAND_MASK
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    #[must_use]
    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[must_use]
    pub fn with_operand(mut self, operand: u32) -> Self {
        self.code = (self.code & !OPERAND_MASK) | (operand & OPERAND_MASK);
        self
    }

    /// Flags and code folded into one word, the form reports carry.
    pub fn packed(&self) -> u64 {
        ((self.flags.bits() as u64) << 32) | self.code as u64
    }

    pub fn name(&self) -> &'static str {
        match self.block() {
            block::BASIC => basic::name(self.operand()),
            block::ROUTE => "ROUTE",
            block::PASS_CHAR => "PASSCHAR",
            block::PASS_KEY => "PASSKEY",
            block::PASS_DOTS => "PASSDOTS",
            block::CONTEXT => "CONTEXT",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command({}+{:#06x}, {:?})",
            self.name(),
            self.operand(),
            self.flags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn block_and_operand_round_trip() {
        let cmd = Command::new(block::ROUTE, 17);
        assert_eq!(cmd.block(), block::ROUTE);
        assert_eq!(cmd.operand(), 17);
        assert_eq!(cmd.name(), "ROUTE");
    }

    #[test]
    fn operand_is_truncated_to_sixteen_bits() {
        let cmd = Command::new(block::PASS_CHAR, 0x1_2345);
        assert_eq!(cmd.operand(), 0x2345);
    }

    #[test]
    fn flags_fold_into_the_upper_word() {
        let cmd = Command::basic(basic::LNDN).with_flags(CommandFlags::LONG_PRESS);
        assert_eq!(cmd.packed() >> 32, CommandFlags::LONG_PRESS.bits() as u64);
        assert_eq!(cmd.packed() as u32, cmd.code());
    }

    #[test]
    fn with_operand_preserves_block_and_flags() {
        let cmd = Command::route(0)
            .with_flags(CommandFlags::SHIFT)
            .with_operand(39);
        assert_eq!(cmd.block(), block::ROUTE);
        assert_eq!(cmd.operand(), 39);
        assert!(cmd.flags().contains(CommandFlags::SHIFT));
    }
}
