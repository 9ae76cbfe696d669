//! LED controller PL IP driver
//!
//! Per-channel PWM generator used for the face-plate LEDs; the hot-swap
//! state machine drives it to produce the blink and lamp-test patterns.
//!
//! # Register Map
//!
//! ```text
//! Offset        Register
//! ------        --------
//! ch*8 + 0x0    PERIOD   (bit 31: PWM enable, bits 30:0 period in ticks)
//! ch*8 + 0x4    COMPARE  (on-time in ticks)
//! ```

use crate::drivers::traits::RegisterIo;
use crate::drivers::{PmcError, PmcResult};

const CHANNEL_STRIDE: usize = 8;
const PERIOD_REG: usize = 0x0;
const COMPARE_REG: usize = 0x4;

const PWM_ENABLE: u32 = 1 << 31;
const PERIOD_MASK: u32 = PWM_ENABLE - 1;

/// Driver for the LED controller IP.
pub struct LedController<R: RegisterIo> {
    regs: R,
    channel_count: usize,
}

impl<R: RegisterIo> LedController<R> {
    pub fn new(regs: R, channel_count: usize) -> Self {
        Self {
            regs,
            channel_count,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn check_channel(&self, ch: usize) -> PmcResult<()> {
        if ch >= self.channel_count {
            return Err(PmcError::InvalidChannel);
        }
        Ok(())
    }

    /// Program one channel: `compare` ticks on out of `period` ticks.
    pub fn set(
        &self,
        ch: usize,
        enable_pwm: bool,
        period_ticks: u32,
        compare_ticks: u32,
    ) -> PmcResult<()> {
        self.check_channel(ch)?;
        let mut period = period_ticks & PERIOD_MASK;
        if enable_pwm {
            period |= PWM_ENABLE;
        }
        self.regs.write(ch * CHANNEL_STRIDE + PERIOD_REG, period);
        self.regs.write(ch * CHANNEL_STRIDE + COMPARE_REG, compare_ticks);
        Ok(())
    }

    /// Solid on (100% duty).
    pub fn on(&self, ch: usize, period_ticks: u32) -> PmcResult<()> {
        self.set(ch, true, period_ticks, period_ticks)
    }

    /// Solid off (0% duty).
    pub fn off(&self, ch: usize, period_ticks: u32) -> PmcResult<()> {
        self.set(ch, true, period_ticks, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::regbank::MockRegisterBank;
    use std::sync::Arc;

    fn controller() -> (LedController<Arc<MockRegisterBank>>, Arc<MockRegisterBank>) {
        let bank = Arc::new(MockRegisterBank::new(0x100));
        (LedController::new(bank.clone(), 4), bank)
    }

    #[test]
    fn test_pwm_programming() {
        let (led, bank) = controller();
        led.set(2, true, 1_000_000, 250_000).unwrap();
        assert_eq!(bank.peek(2 * 8), PWM_ENABLE | 1_000_000);
        assert_eq!(bank.peek(2 * 8 + 4), 250_000);
    }

    #[test]
    fn test_enable_bit_not_set_when_disabled() {
        let (led, bank) = controller();
        led.set(0, false, 500, 100).unwrap();
        assert_eq!(bank.peek(0), 500);
    }

    #[test]
    fn test_on_off_duty() {
        let (led, bank) = controller();
        led.on(1, 1_000).unwrap();
        assert_eq!(bank.peek(8 + 4), 1_000);
        led.off(1, 1_000).unwrap();
        assert_eq!(bank.peek(8 + 4), 0);
    }

    #[test]
    fn test_invalid_channel() {
        let (led, _bank) = controller();
        assert_eq!(led.set(4, true, 1, 1), Err(PmcError::InvalidChannel));
    }
}
