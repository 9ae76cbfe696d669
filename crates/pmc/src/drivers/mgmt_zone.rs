//! Management zone controller PL IP driver
//!
//! Sequenced power-on/off of up to 32 enable pins grouped into up to 16
//! zones, cross-coupled to a 64-bit hard-fault input vector. Per-pin timing
//! and the fault interlocks run in fabric; a zone command is a single
//! register write and cannot be observed half-applied. Fault-driven
//! shutdown is reported through state transitions and the IRQ status word,
//! never through API return values.
//!
//! # Register Map
//!
//! ```text
//! Offset   Register
//! ------   --------
//! 0x000    HARD_FAULT_STATUS_0
//! 0x004    HARD_FAULT_STATUS_1
//! 0x008    IRQ_STATUS
//! 0x00C    IRQ_EN
//! 0x010    IRQ_ACK
//! 0x014    PWR_EN_AGGR_STATUS       (logical level per pin)
//! 0x018    SEQ_TIMER_MAX
//! 0x020+   per-pin blocks, stride 16: CFG_0 (timer ticks),
//!          CFG_1 (level/drive in [17:16], owning zones in [15:0]),
//!          INDIV_STATUS
//! 0x200    PWR_EN_OVRD
//! 0x204    PWR_EN_OVRD_DRIVE
//! 0x208    PWR_EN_OVRD_LVL
//! 0x20C    PWR_EN_OVRD_READ
//! 0x400+   per-zone blocks, stride 32: PWR_STATUS, HARD_FAULT_MASK_0,
//!          HARD_FAULT_MASK_1, HOLDOFF, SOFT_FAULT, PWR_ON_INIT,
//!          PWR_OFF_INIT
//! ```

use crate::drivers::traits::RegisterIo;
use crate::drivers::{PmcError, PmcResult};

/// Core clock feeding the sequence timers.
pub const CORE_CLK_FREQ_HZ: u32 = 50_000_000;

/// Hardware limits of the IP.
pub const MAX_ZONES: usize = 16;
pub const MAX_PWREN: usize = 32;
pub const MAX_HARD_FAULTS: usize = 64;

/// Register offsets
mod regs {
    pub const HARD_FAULT_STATUS_0: usize = 0x000;
    pub const HARD_FAULT_STATUS_1: usize = 0x004;
    pub const IRQ_STATUS: usize = 0x008;
    pub const IRQ_EN: usize = 0x00C;
    pub const IRQ_ACK: usize = 0x010;
    pub const PWR_EN_AGGR_STATUS: usize = 0x014;
    pub const SEQ_TIMER_MAX: usize = 0x018;

    pub const PIN_BASE: usize = 0x020;
    pub const PIN_STRIDE: usize = 16;
    pub const PIN_CFG_0: usize = 0;
    pub const PIN_CFG_1: usize = 4;
    pub const PIN_INDIV_STATUS: usize = 8;

    pub const PWR_EN_OVRD: usize = 0x200;
    pub const PWR_EN_OVRD_DRIVE: usize = 0x204;
    pub const PWR_EN_OVRD_LVL: usize = 0x208;
    pub const PWR_EN_OVRD_READ: usize = 0x20C;

    pub const ZONE_BASE: usize = 0x400;
    pub const ZONE_STRIDE: usize = 32;
    pub const ZONE_HARD_FAULT_MASK_0: usize = 4;
    pub const ZONE_HARD_FAULT_MASK_1: usize = 8;
    pub const ZONE_HOLDOFF: usize = 12;
    pub const ZONE_SOFT_FAULT: usize = 16;
    pub const ZONE_PWR_ON_INIT: usize = 20;
    pub const ZONE_PWR_OFF_INIT: usize = 24;

    pub const fn pin(p: usize, reg: usize) -> usize {
        PIN_BASE + p * PIN_STRIDE + reg
    }

    pub const fn zone(z: usize, reg: usize) -> usize {
        ZONE_BASE + z * ZONE_STRIDE + reg
    }
}

/// CFG_1 bit positions.
const CFG1_ACTIVE_LEVEL: u32 = 1 << 16;
const CFG1_DRIVE_ENABLE: u32 = 1 << 17;
const CFG1_ZONE_MASK: u32 = 0xFFFF;

/// Milliseconds to core-clock ticks.
#[inline]
const fn ms_to_ticks(ms: u16) -> u32 {
    ms as u32 * (CORE_CLK_FREQ_HZ / 1000)
}

/// Core-clock ticks back to milliseconds.
#[inline]
const fn ticks_to_ms(ticks: u32) -> u16 {
    (ticks / (CORE_CLK_FREQ_HZ / 1000)) as u16
}

/// Power state of one pin or one zone.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum PowerState {
    Off = 0,
    TransOff = 1,
    TransOn = 2,
    On = 3,
}

impl PowerState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::TransOff,
            2 => Self::TransOn,
            3 => Self::On,
            _ => Self::Off,
        }
    }
}

/// Per-pin sequencing configuration within one zone. A zero timer means the
/// pin is not used by the zone.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PwrEnConfig {
    /// Sequence delay in milliseconds; the pin asserts when the power-on
    /// counter reaches this value and deasserts when the power-off counter
    /// counts down to it.
    pub timer_ms: u16,
    /// Drive high when asserted (false: active low).
    pub active_level: bool,
    /// Drive the line at all (false: tri-state).
    pub drive_enable: bool,
}

/// Full configuration of one management zone.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ZoneConfig {
    /// Which of the 64 hard-fault inputs force this zone off.
    pub hardfault_mask: u64,
    /// Window after power-on during which faults are ignored.
    pub fault_holdoff_ms: u16,
    pub pwren: [PwrEnConfig; MAX_PWREN],
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            hardfault_mask: 0,
            fault_holdoff_ms: 0,
            pwren: [PwrEnConfig::default(); MAX_PWREN],
        }
    }
}

/// Driver for the management zone controller IP.
pub struct MgmtZoneController<R: RegisterIo> {
    regs: R,
    zone_count: usize,
    pin_count: usize,
}

impl<R: RegisterIo> MgmtZoneController<R> {
    /// Wrap the IP with its build-time zone/pin counts.
    pub fn new(regs: R, zone_count: usize, pin_count: usize) -> Self {
        debug_assert!(zone_count <= MAX_ZONES);
        debug_assert!(pin_count <= MAX_PWREN);
        Self {
            regs,
            zone_count,
            pin_count,
        }
    }

    pub fn zone_count(&self) -> usize {
        self.zone_count
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count
    }

    fn check_zone(&self, zone: usize) -> PmcResult<()> {
        if zone >= self.zone_count {
            return Err(PmcError::InvalidZone);
        }
        Ok(())
    }

    /// Live 64-bit hard-fault input vector.
    pub fn hard_fault_status(&self) -> u64 {
        let lo = self.regs.read(regs::HARD_FAULT_STATUS_0) as u64;
        let hi = self.regs.read(regs::HARD_FAULT_STATUS_1) as u64;
        (hi << 32) | lo
    }

    /// Program a zone: fault mask, holdoff, and every pin with a nonzero
    /// timer. Pins keep their membership in other zones.
    pub fn set_zone_config(&self, zone: usize, cfg: &ZoneConfig) -> PmcResult<()> {
        self.check_zone(zone)?;

        self.regs.write(
            regs::zone(zone, regs::ZONE_HARD_FAULT_MASK_0),
            (cfg.hardfault_mask & 0xFFFF_FFFF) as u32,
        );
        self.regs.write(
            regs::zone(zone, regs::ZONE_HARD_FAULT_MASK_1),
            (cfg.hardfault_mask >> 32) as u32,
        );
        self.regs.write(
            regs::zone(zone, regs::ZONE_HOLDOFF),
            ms_to_ticks(cfg.fault_holdoff_ms),
        );

        for (pin, pincfg) in cfg.pwren.iter().enumerate().take(self.pin_count) {
            if pincfg.timer_ms == 0 {
                continue;
            }
            let mut cfg1 = self.regs.read(regs::pin(pin, regs::PIN_CFG_1));
            cfg1 &= !(CFG1_ACTIVE_LEVEL | CFG1_DRIVE_ENABLE);
            if pincfg.active_level {
                cfg1 |= CFG1_ACTIVE_LEVEL;
            }
            if pincfg.drive_enable {
                cfg1 |= CFG1_DRIVE_ENABLE;
            }
            cfg1 |= 1 << zone;
            self.regs
                .write(regs::pin(pin, regs::PIN_CFG_0), ms_to_ticks(pincfg.timer_ms));
            self.regs.write(regs::pin(pin, regs::PIN_CFG_1), cfg1);
        }
        Ok(())
    }

    /// Read back a zone's configuration, tick values converted to ms.
    pub fn get_zone_config(&self, zone: usize) -> PmcResult<ZoneConfig> {
        self.check_zone(zone)?;

        let lo = self.regs.read(regs::zone(zone, regs::ZONE_HARD_FAULT_MASK_0)) as u64;
        let hi = self.regs.read(regs::zone(zone, regs::ZONE_HARD_FAULT_MASK_1)) as u64;
        let mut cfg = ZoneConfig {
            hardfault_mask: (hi << 32) | lo,
            fault_holdoff_ms: ticks_to_ms(self.regs.read(regs::zone(zone, regs::ZONE_HOLDOFF))),
            ..Default::default()
        };

        for pin in 0..self.pin_count {
            let cfg1 = self.regs.read(regs::pin(pin, regs::PIN_CFG_1));
            if cfg1 & CFG1_ZONE_MASK & (1 << zone) == 0 {
                continue;
            }
            cfg.pwren[pin] = PwrEnConfig {
                timer_ms: ticks_to_ms(self.regs.read(regs::pin(pin, regs::PIN_CFG_0))),
                active_level: cfg1 & CFG1_ACTIVE_LEVEL != 0,
                drive_enable: cfg1 & CFG1_DRIVE_ENABLE != 0,
            };
        }
        Ok(cfg)
    }

    /// Aggregate power state of a zone, derived from its pins: any pin in
    /// TRANS_ON wins, else TRANS_OFF, else ON, else OFF. A zone with no
    /// assigned pins is OFF.
    pub fn get_zone_state(&self, zone: usize) -> PmcResult<PowerState> {
        self.check_zone(zone)?;

        let mut on = 0u32;
        let mut trans_on = 0u32;
        let mut trans_off = 0u32;
        for pin in 0..self.pin_count {
            let cfg1 = self.regs.read(regs::pin(pin, regs::PIN_CFG_1));
            if cfg1 & CFG1_ZONE_MASK & (1 << zone) == 0 {
                continue;
            }
            match PowerState::from_raw(self.regs.read(regs::pin(pin, regs::PIN_INDIV_STATUS))) {
                PowerState::On => on += 1,
                PowerState::TransOn => trans_on += 1,
                PowerState::TransOff => trans_off += 1,
                PowerState::Off => {}
            }
        }

        Ok(if trans_on != 0 {
            PowerState::TransOn
        } else if trans_off != 0 {
            PowerState::TransOff
        } else if on != 0 {
            PowerState::On
        } else {
            PowerState::Off
        })
    }

    /// Aggregate logical pin level vector.
    pub fn pwr_en_status(&self) -> u32 {
        self.regs.read(regs::PWR_EN_AGGR_STATUS)
    }

    /// Kick off the hardware power-on sequence for a zone.
    pub fn power_on_sequence(&self, zone: usize) -> PmcResult<()> {
        self.check_zone(zone)?;
        self.regs
            .write(regs::zone(zone, regs::ZONE_PWR_ON_INIT), 1 << zone);
        Ok(())
    }

    /// Kick off the hardware power-off sequence for a zone.
    pub fn power_off_sequence(&self, zone: usize) -> PmcResult<()> {
        self.check_zone(zone)?;
        self.regs
            .write(regs::zone(zone, regs::ZONE_PWR_OFF_INIT), 1 << zone);
        Ok(())
    }

    /// Raise a software fault against one zone, equivalent to an enabled
    /// hard fault targeting only that zone.
    pub fn dispatch_soft_fault(&self, zone: usize) -> PmcResult<()> {
        self.check_zone(zone)?;
        self.regs
            .write(regs::zone(zone, regs::ZONE_SOFT_FAULT), 1 << zone);
        Ok(())
    }

    /// Upper bound of the power-off countdown, shared by all pins. Must be
    /// at least the largest per-pin timer configured on the controller.
    pub fn set_sequence_timer_max(&self, ms: u16) {
        self.regs.write(regs::SEQ_TIMER_MAX, ms_to_ticks(ms));
    }

    pub fn get_sequence_timer_max(&self) -> u16 {
        ticks_to_ms(self.regs.read(regs::SEQ_TIMER_MAX))
    }

    pub fn set_irq_enables(&self, mask: u32) {
        self.regs.write(regs::IRQ_EN, mask);
    }

    pub fn irq_enables(&self) -> u32 {
        self.regs.read(regs::IRQ_EN)
    }

    pub fn irq_status(&self) -> u32 {
        self.regs.read(regs::IRQ_STATUS)
    }

    pub fn ack_irq(&self, mask: u32) {
        self.regs.write(regs::IRQ_ACK, mask);
    }

    /// Override masks forcing pins regardless of zone state; bring-up and
    /// lab testing only.
    pub fn set_enable_override(&self, mask: u32) {
        self.regs.write(regs::PWR_EN_OVRD, mask);
    }

    pub fn enable_override(&self) -> u32 {
        self.regs.read(regs::PWR_EN_OVRD)
    }

    pub fn set_override_drive(&self, mask: u32) {
        self.regs.write(regs::PWR_EN_OVRD_DRIVE, mask);
    }

    pub fn override_drive(&self) -> u32 {
        self.regs.read(regs::PWR_EN_OVRD_DRIVE)
    }

    pub fn set_override_level(&self, mask: u32) {
        self.regs.write(regs::PWR_EN_OVRD_LVL, mask);
    }

    pub fn override_level(&self) -> u32 {
        self.regs.read(regs::PWR_EN_OVRD_LVL)
    }

    /// Raw input level of tri-stated pins.
    pub fn override_input(&self) -> u32 {
        self.regs.read(regs::PWR_EN_OVRD_READ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::zone_ip::SimZoneIp;
    use std::sync::Arc;

    fn controller() -> (MgmtZoneController<Arc<SimZoneIp>>, Arc<SimZoneIp>) {
        let ip = Arc::new(SimZoneIp::new(16, 32));
        (MgmtZoneController::new(ip.clone(), 16, 32), ip)
    }

    fn two_pin_config() -> ZoneConfig {
        let mut cfg = ZoneConfig {
            hardfault_mask: 0,
            fault_holdoff_ms: 0,
            ..Default::default()
        };
        cfg.pwren[5] = PwrEnConfig {
            timer_ms: 100,
            active_level: true,
            drive_enable: true,
        };
        cfg.pwren[6] = PwrEnConfig {
            timer_ms: 200,
            active_level: true,
            drive_enable: true,
        };
        cfg
    }

    #[test]
    fn test_tick_conversion_round_trip() {
        assert_eq!(ms_to_ticks(100), 5_000_000);
        assert_eq!(ticks_to_ms(5_000_000), 100);
        for ms in [0u16, 1, 7, 100, 1000, u16::MAX] {
            assert_eq!(ticks_to_ms(ms_to_ticks(ms)), ms);
        }
    }

    #[test]
    fn test_invalid_zone_rejected() {
        let (mzc, _ip) = controller();
        assert_eq!(
            mzc.set_zone_config(16, &ZoneConfig::default()),
            Err(PmcError::InvalidZone)
        );
        assert_eq!(mzc.power_on_sequence(16), Err(PmcError::InvalidZone));
        assert_eq!(mzc.power_off_sequence(16), Err(PmcError::InvalidZone));
        assert_eq!(mzc.dispatch_soft_fault(16), Err(PmcError::InvalidZone));
        assert!(mzc.get_zone_state(16).is_err());
    }

    #[test]
    fn test_zone_config_round_trip() {
        let (mzc, _ip) = controller();
        let mut cfg = two_pin_config();
        cfg.hardfault_mask = 0x0000_0001_8000_0002;
        cfg.fault_holdoff_ms = 50;
        mzc.set_zone_config(2, &cfg).unwrap();

        let read = mzc.get_zone_config(2).unwrap();
        assert_eq!(read, cfg);

        // A zone that owns nothing reads back empty.
        let other = mzc.get_zone_config(3).unwrap();
        assert_eq!(other.pwren, [PwrEnConfig::default(); MAX_PWREN]);
    }

    #[test]
    fn test_pin_membership_is_additive() {
        let (mzc, _ip) = controller();
        let mut cfg_a = ZoneConfig::default();
        cfg_a.pwren[3] = PwrEnConfig {
            timer_ms: 10,
            active_level: true,
            drive_enable: true,
        };
        mzc.set_zone_config(0, &cfg_a).unwrap();
        mzc.set_zone_config(4, &cfg_a).unwrap();

        // Both zones still own pin 3.
        assert_eq!(mzc.get_zone_config(0).unwrap().pwren[3].timer_ms, 10);
        assert_eq!(mzc.get_zone_config(4).unwrap().pwren[3].timer_ms, 10);
    }

    #[test]
    fn test_empty_zone_reports_off() {
        let (mzc, _ip) = controller();
        assert_eq!(mzc.get_zone_state(7).unwrap(), PowerState::Off);
    }

    #[test]
    fn test_power_on_sequence_timing() {
        let (mzc, ip) = controller();
        mzc.set_zone_config(2, &two_pin_config()).unwrap();
        mzc.set_sequence_timer_max(200);

        mzc.power_on_sequence(2).unwrap();
        assert_eq!(mzc.get_zone_state(2).unwrap(), PowerState::TransOn);

        // Mid-sequence: pin 5 (100 ms) has asserted, pin 6 (200 ms) not yet.
        ip.advance_ms(150);
        let levels = mzc.pwr_en_status();
        assert_ne!(levels & (1 << 5), 0);
        assert_eq!(levels & (1 << 6), 0);
        assert_eq!(mzc.get_zone_state(2).unwrap(), PowerState::TransOn);

        // Sequence complete: both high, zone ON.
        ip.advance_ms(50);
        let levels = mzc.pwr_en_status();
        assert_ne!(levels & (1 << 5), 0);
        assert_ne!(levels & (1 << 6), 0);
        assert_eq!(mzc.get_zone_state(2).unwrap(), PowerState::On);
    }

    #[test]
    fn test_power_off_reverses_order() {
        let (mzc, ip) = controller();
        mzc.set_zone_config(2, &two_pin_config()).unwrap();
        mzc.set_sequence_timer_max(200);
        mzc.power_on_sequence(2).unwrap();
        ip.advance_ms(200);
        assert_eq!(mzc.get_zone_state(2).unwrap(), PowerState::On);

        mzc.power_off_sequence(2).unwrap();
        // Pin 6 (delay 200 = timer max) drops immediately; pin 5 holds until
        // the countdown reaches 100.
        ip.advance_ms(1);
        let levels = mzc.pwr_en_status();
        assert_eq!(levels & (1 << 6), 0);
        assert_ne!(levels & (1 << 5), 0);
        assert_eq!(mzc.get_zone_state(2).unwrap(), PowerState::TransOff);

        ip.advance_ms(99);
        assert_eq!(mzc.pwr_en_status() & (1 << 5), 0);
        assert_eq!(mzc.get_zone_state(2).unwrap(), PowerState::Off);
    }

    #[test]
    fn test_soft_fault_forces_zone_off() {
        let (mzc, ip) = controller();
        mzc.set_zone_config(1, &two_pin_config()).unwrap();
        mzc.set_sequence_timer_max(200);
        mzc.power_on_sequence(1).unwrap();
        ip.advance_ms(200);
        assert_eq!(mzc.get_zone_state(1).unwrap(), PowerState::On);

        mzc.dispatch_soft_fault(1).unwrap();
        assert_eq!(mzc.get_zone_state(1).unwrap(), PowerState::Off);
        assert_eq!(mzc.pwr_en_status() & ((1 << 5) | (1 << 6)), 0);
    }

    #[test]
    fn test_hard_fault_respects_mask_and_holdoff() {
        let (mzc, ip) = controller();
        let mut cfg = two_pin_config();
        cfg.hardfault_mask = 1 << 40;
        cfg.fault_holdoff_ms = 50;
        mzc.set_zone_config(2, &cfg).unwrap();
        mzc.set_sequence_timer_max(200);

        mzc.power_on_sequence(2).unwrap();

        // Fault inside the holdoff window is ignored.
        ip.set_hard_fault(40, true);
        ip.advance_ms(10);
        assert_ne!(mzc.get_zone_state(2).unwrap(), PowerState::Off);
        ip.set_hard_fault(40, false);
        assert_eq!(mzc.hard_fault_status(), 0);

        ip.advance_ms(190);
        assert_eq!(mzc.get_zone_state(2).unwrap(), PowerState::On);

        // Unmasked line does nothing.
        ip.set_hard_fault(3, true);
        ip.advance_ms(1);
        assert_eq!(mzc.get_zone_state(2).unwrap(), PowerState::On);
        assert_eq!(mzc.hard_fault_status(), 1 << 3);

        // Masked line past holdoff kills the zone.
        ip.set_hard_fault(40, true);
        ip.advance_ms(1);
        assert_eq!(mzc.get_zone_state(2).unwrap(), PowerState::Off);
    }

    #[test]
    fn test_completion_sets_irq_status() {
        let (mzc, ip) = controller();
        mzc.set_zone_config(0, &two_pin_config()).unwrap();
        mzc.set_sequence_timer_max(200);
        mzc.set_irq_enables(1 << 0);

        mzc.power_on_sequence(0).unwrap();
        ip.advance_ms(200);
        assert_ne!(mzc.irq_status() & 1, 0);

        mzc.ack_irq(1);
        assert_eq!(mzc.irq_status() & 1, 0);
    }

    #[test]
    fn test_override_registers() {
        let (mzc, ip) = controller();
        mzc.set_enable_override(0x0000_0030);
        mzc.set_override_drive(0x0000_0010);
        mzc.set_override_level(0x0000_0020);
        assert_eq!(mzc.enable_override(), 0x30);
        assert_eq!(mzc.override_drive(), 0x10);
        assert_eq!(mzc.override_level(), 0x20);

        ip.set_input_levels(0xCAFE);
        assert_eq!(mzc.override_input(), 0xCAFE);
    }

    #[test]
    fn test_sequence_timer_max_round_trip() {
        let (mzc, _ip) = controller();
        mzc.set_sequence_timer_max(500);
        assert_eq!(mzc.get_sequence_timer_max(), 500);
    }
}
