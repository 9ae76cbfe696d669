/// Device drivers

pub mod timeout; // Timeout utilities for hardware operations
pub mod error;   // Common driver error types

pub mod traits;      // Hardware capability traits (register banks, EEPROM, I2C, ADC)
pub mod watchdog;    // Slot-based software watchdog
pub mod sensor_proc; // Sensor threshold processor PL IP
pub mod mgmt_zone;   // Management zone controller PL IP
pub mod ipmb;        // IPMB slave/master transceiver
pub mod led;         // LED controller PL IP

// Behavioral device models for hosted testing and bring-up rigs
#[cfg(any(test, feature = "mock-devices"))]
pub mod mock;

// Re-export common types for convenience
pub use error::{PmcError, PmcResult};
pub use timeout::Timeout;
