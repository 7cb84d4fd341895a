#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(not(target_os = "none"), allow(dead_code))]

mod app;
mod display;
mod flash;
mod hw;
mod mailbox;
mod mqtt;
mod net;
mod shared;
mod status;
mod telemetry;
mod time;

#[cfg(target_os = "none")]
mod panic;
#[cfg(target_os = "none")]
mod runtime;

#[cfg(not(target_os = "none"))]
fn main() {}
