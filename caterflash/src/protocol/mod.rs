//! Protocol implementations.

pub mod avr109;

pub use avr109::{Command, CommandFrame, FlashState, Outcome, SessionPosition};
