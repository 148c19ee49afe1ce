//! core-commands: command codes and the prioritized handler stack.

mod code;
mod queue;

pub use code::{BLOCK_MASK, BLOCK_SHIFT, Command, CommandFlags, OPERAND_MASK, basic, block, passkey};
pub use queue::CommandQueue;
