//! Behavioral device models for hosted testing and bring-up rigs.
//!
//! Each model implements the same capability trait as the real hardware and
//! reproduces the externally observable behavior the drivers rely on, so
//! driver logic is exercised on the host exactly as it runs on the target.

pub mod clock;
pub mod eeprom;
pub mod i2c;
pub mod regbank;
pub mod sensor_ip;
pub mod zone_ip;

pub use clock::MockClock;
pub use eeprom::RamEeprom;
pub use i2c::MockI2cStation;
pub use regbank::MockRegisterBank;
pub use sensor_ip::SimSensorIp;
pub use zone_ip::SimZoneIp;
