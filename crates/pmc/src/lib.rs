//! Platform Management Core for an ATCA/MicroTCA IPMC.
//!
//! This crate is the hardware-facing core of the controller firmware. It
//! drives the custom programmable-logic IPs (sensor threshold processor,
//! management zone controller, LED controller), the PS I2C station used for
//! IPMB, and the EEPROM-backed persistent storage service shared by every
//! configuration consumer.
//!
//! All hardware access goes through the capability traits in
//! [`drivers::traits`]; the crate itself is freestanding (`no_std` + `alloc`)
//! and is exercised on the host against the behavioral device models in
//! `drivers::mock`.

#![cfg_attr(not(test), no_std)]

// Required for heap allocation
extern crate alloc;

// MMIO access layer
pub mod hal;
// ISR-to-task queues
pub mod channel;
// Injected time source
pub mod time;
// Device drivers (PL IPs, IPMB, watchdog) and the hardware trait seams
pub mod drivers;
// Persistent storage service
pub mod storage;

pub use drivers::error::{PmcError, PmcResult};
