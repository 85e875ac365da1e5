#![no_std]

// Shared logic for the trim-tab actuator controller.
//
// Everything here builds without the standard library so the STM32 firmware
// and the host emulator drive the exact same mailbox, position model,
// persistence backends, and control state machine.

#[macro_use]
mod log;

pub mod actuator;
pub mod console;
pub mod control;
pub mod gauge;
pub mod mailbox;
pub mod nvstate;
pub mod sources;
pub mod ticks;
