#![no_std]

// Device logic for the Home Buttons wall switch.
//
// Gesture classification, LED feedback, connectivity sequencing and the boot
// orchestrator live here without the standard library so the firmware and the
// host emulator drive the same state machines.

pub mod connectivity;
pub mod gesture;
pub mod led;
pub mod orchestrator;
pub mod power;
pub mod publish;
pub mod state;
pub mod telemetry;
pub mod time;
pub mod topics;
