//! Sensor threshold processor PL IP driver
//!
//! The IP watches N analog channels in hardware, comparing every new sample
//! against six IPMI thresholds with hysteresis and latching
//! assertion/deassertion events. Latched events raise one interrupt; the
//! handler drains them into an elastic queue so bursty crossings survive
//! userland latency. Fault outputs of this IP are wired in fabric to the
//! management zone controller's hard-fault inputs; software only configures
//! masks.
//!
//! # Register Map
//!
//! ```text
//! Offset    Register
//! ------    --------
//! 0x000     RESET
//! 0x004     IRQ_REQ
//! 0x008     IRQ_ACK
//! 0x100+    Per-register channel blocks (256 bytes each, channel at +4*ch):
//!           raw reading, threshold status, assert/deassert event enables,
//!           assert/deassert rearm, current assert state,
//!           latched assert state, latched deassert state
//! 0x1000+   Threshold/hysteresis config blocks (same indexing):
//!           LNC, LCR, LNR, UNC, UCR, UNR, HYST_POS, HYST_NEG
//! ```

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::channel::SpscQueue;
use crate::drivers::timeout::Timeout;
use crate::drivers::traits::{AdcReadout, RegisterIo};
use crate::drivers::{PmcError, PmcResult};
use crate::time::Clock;

/// Register offsets
mod regs {
    pub const RESET: usize = 0x000;
    pub const IRQ_REQ: usize = 0x004;
    pub const IRQ_ACK: usize = 0x008;

    pub const CH_STAT_BASE: usize = 0x100;
    pub const RAW_READING: usize = 0; // block indices within CH_STAT_BASE
    pub const THR_STATUS: usize = 1;
    pub const EV_ASSERT_EN: usize = 2;
    pub const EV_DEASSERT_EN: usize = 3;
    pub const EV_ASSERT_REARM: usize = 4;
    pub const EV_DEASSERT_REARM: usize = 5;
    pub const EV_ASSERT_CUR: usize = 6;
    pub const EV_ASSERT_ST: usize = 7;
    pub const EV_DEASSERT_ST: usize = 8;

    pub const CH_CONFIG_BASE: usize = 0x1000;
    pub const LNC: usize = 0; // block indices within CH_CONFIG_BASE
    pub const LCR: usize = 1;
    pub const LNR: usize = 2;
    pub const UNC: usize = 3;
    pub const UCR: usize = 4;
    pub const UNR: usize = 5;
    pub const HYST_POS: usize = 6;
    pub const HYST_NEG: usize = 7;

    pub const BLOCK_STRIDE: usize = 256;

    pub const fn stat(block: usize, ch: usize) -> usize {
        CH_STAT_BASE + block * BLOCK_STRIDE + ch * 4
    }

    pub const fn config(block: usize, ch: usize) -> usize {
        CH_CONFIG_BASE + block * BLOCK_STRIDE + ch * 4
    }
}

bitflags! {
    /// The twelve IPMI threshold event bits, one per threshold and
    /// direction.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct EventMask: u16 {
        const LNC_LOW  = 1 << 0;
        const LNC_HIGH = 1 << 1;
        const LCR_LOW  = 1 << 2;
        const LCR_HIGH = 1 << 3;
        const LNR_LOW  = 1 << 4;
        const LNR_HIGH = 1 << 5;
        const UNC_LOW  = 1 << 6;
        const UNC_HIGH = 1 << 7;
        const UCR_LOW  = 1 << 8;
        const UCR_HIGH = 1 << 9;
        const UNR_LOW  = 1 << 10;
        const UNR_HIGH = 1 << 11;
    }
}

bitflags! {
    /// Threshold comparison byte: which thresholds the latest reading is
    /// currently past.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ThresholdStatus: u8 {
        const LNC = 1 << 0;
        const LCR = 1 << 1;
        const LNR = 1 << 2;
        const UNC = 1 << 3;
        const UCR = 1 << 4;
        const UNR = 1 << 5;
    }
}

/// Raw threshold configuration for one channel, in ADC units.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Thresholds {
    pub lnc: u16,
    pub lcr: u16,
    pub lnr: u16,
    pub unc: u16,
    pub ucr: u16,
    pub unr: u16,
}

/// Hysteresis in raw units around each threshold.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Hysteresis {
    pub pos: u16,
    pub neg: u16,
}

/// One latched threshold crossing, with the reading sampled at interrupt
/// time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SensorEvent {
    pub channel: usize,
    pub reading: u16,
    pub assert_mask: EventMask,
    pub deassert_mask: EventMask,
}

/// Event-flow statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorStats {
    pub events_received: u64,
    pub events_dropped: u64,
    pub events_delivered: u64,
    pub isr_queue_highwater: usize,
    pub userland_queue_highwater: usize,
}

/// Driver for the sensor threshold processor IP.
pub struct SensorProcessor<R: RegisterIo> {
    regs: R,
    channel_count: usize,
    /// Per-channel raw-sample sources, invoked from the interrupt handler.
    readouts: Vec<Arc<dyn AdcReadout>>,
    clock: Arc<dyn Clock>,

    /// Bounded ISR-to-task queue, sized so every channel can fire at once
    /// with headroom.
    isrq: SpscQueue<SensorEvent>,
    /// Elastic single-consumer buffer between the ISR queue and userland.
    events: spin::Mutex<VecDeque<SensorEvent>>,

    events_received: AtomicU64,
    events_dropped: AtomicU64,
    events_delivered: AtomicU64,
    isr_queue_highwater: AtomicUsize,
    userland_queue_highwater: AtomicUsize,
}

impl<R: RegisterIo> SensorProcessor<R> {
    /// Initialize the IP, one readout source per hardware channel.
    pub fn new(regs: R, readouts: Vec<Arc<dyn AdcReadout>>, clock: Arc<dyn Clock>) -> Self {
        let channel_count = readouts.len();
        let sp = Self {
            regs,
            channel_count,
            readouts,
            clock,
            isrq: SpscQueue::new(channel_count + channel_count / 2),
            events: spin::Mutex::new(VecDeque::new()),
            events_received: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            isr_queue_highwater: AtomicUsize::new(0),
            userland_queue_highwater: AtomicUsize::new(0),
        };
        sp.reset();
        sp
    }

    /// Number of channels implemented in fabric.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Pulse the IP reset, clearing all latched state.
    pub fn reset(&self) {
        self.regs.write(regs::RESET, 1);
        self.regs.write(regs::RESET, 0);
    }

    fn check_channel(&self, ch: usize) -> PmcResult<()> {
        if ch >= self.channel_count {
            return Err(PmcError::InvalidChannel);
        }
        Ok(())
    }

    pub fn set_hysteresis(&self, ch: usize, hyst: Hysteresis) -> PmcResult<()> {
        self.check_channel(ch)?;
        self.regs.write(regs::config(regs::HYST_POS, ch), hyst.pos as u32);
        self.regs.write(regs::config(regs::HYST_NEG, ch), hyst.neg as u32);
        Ok(())
    }

    pub fn get_hysteresis(&self, ch: usize) -> PmcResult<Hysteresis> {
        self.check_channel(ch)?;
        Ok(Hysteresis {
            pos: self.regs.read(regs::config(regs::HYST_POS, ch)) as u16,
            neg: self.regs.read(regs::config(regs::HYST_NEG, ch)) as u16,
        })
    }

    pub fn set_thresholds(&self, ch: usize, thr: Thresholds) -> PmcResult<()> {
        self.check_channel(ch)?;
        self.regs.write(regs::config(regs::UNR, ch), thr.unr as u32);
        self.regs.write(regs::config(regs::UCR, ch), thr.ucr as u32);
        self.regs.write(regs::config(regs::UNC, ch), thr.unc as u32);
        self.regs.write(regs::config(regs::LNR, ch), thr.lnr as u32);
        self.regs.write(regs::config(regs::LCR, ch), thr.lcr as u32);
        self.regs.write(regs::config(regs::LNC, ch), thr.lnc as u32);
        Ok(())
    }

    pub fn get_thresholds(&self, ch: usize) -> PmcResult<Thresholds> {
        self.check_channel(ch)?;
        Ok(Thresholds {
            unr: self.regs.read(regs::config(regs::UNR, ch)) as u16,
            ucr: self.regs.read(regs::config(regs::UCR, ch)) as u16,
            unc: self.regs.read(regs::config(regs::UNC, ch)) as u16,
            lnr: self.regs.read(regs::config(regs::LNR, ch)) as u16,
            lcr: self.regs.read(regs::config(regs::LCR, ch)) as u16,
            lnc: self.regs.read(regs::config(regs::LNC, ch)) as u16,
        })
    }

    /// Enable or disable event generation per direction.
    ///
    /// The IP re-presents any condition that is already satisfied at the
    /// moment its event bit becomes enabled. To keep stale state from being
    /// delivered as a fresh event, bits that are about to transition from
    /// disabled to enabled are rearmed first, then the new masks are
    /// written.
    pub fn set_event_enable(
        &self,
        ch: usize,
        assert: EventMask,
        deassert: EventMask,
    ) -> PmcResult<()> {
        self.check_channel(ch)?;
        let (old_assert, old_deassert) = self.get_event_enable(ch)?;
        self.rearm(ch, assert & !old_assert, deassert & !old_deassert)?;
        self.regs
            .write(regs::stat(regs::EV_ASSERT_EN, ch), assert.bits() as u32);
        self.regs
            .write(regs::stat(regs::EV_DEASSERT_EN, ch), deassert.bits() as u32);
        Ok(())
    }

    pub fn get_event_enable(&self, ch: usize) -> PmcResult<(EventMask, EventMask)> {
        self.check_channel(ch)?;
        Ok((
            EventMask::from_bits_truncate(self.regs.read(regs::stat(regs::EV_ASSERT_EN, ch)) as u16),
            EventMask::from_bits_truncate(
                self.regs.read(regs::stat(regs::EV_DEASSERT_EN, ch)) as u16
            ),
        ))
    }

    /// Clear latched events so the next crossing latches anew. The rearm
    /// registers are pulsed: written with the mask, then written back to
    /// zero.
    pub fn rearm(&self, ch: usize, assert: EventMask, deassert: EventMask) -> PmcResult<()> {
        self.check_channel(ch)?;
        self.regs
            .write(regs::stat(regs::EV_ASSERT_REARM, ch), assert.bits() as u32);
        self.regs.write(regs::stat(regs::EV_ASSERT_REARM, ch), 0);
        self.regs
            .write(regs::stat(regs::EV_DEASSERT_REARM, ch), deassert.bits() as u32);
        self.regs.write(regs::stat(regs::EV_DEASSERT_REARM, ch), 0);
        Ok(())
    }

    /// Latched (and still enabled) assertion/deassertion events.
    pub fn latched_status(&self, ch: usize) -> PmcResult<(EventMask, EventMask)> {
        self.check_channel(ch)?;
        Ok((
            EventMask::from_bits_truncate(self.regs.read(regs::stat(regs::EV_ASSERT_ST, ch)) as u16),
            EventMask::from_bits_truncate(
                self.regs.read(regs::stat(regs::EV_DEASSERT_ST, ch)) as u16
            ),
        ))
    }

    /// Live assertion state. The IP does not expose a live deassertion word;
    /// the second mask is always empty.
    pub fn current_status(&self, ch: usize) -> PmcResult<(EventMask, EventMask)> {
        self.check_channel(ch)?;
        Ok((
            EventMask::from_bits_truncate(self.regs.read(regs::stat(regs::EV_ASSERT_CUR, ch)) as u16),
            EventMask::empty(),
        ))
    }

    /// Latest raw sample and its threshold comparison byte.
    pub fn reading(&self, ch: usize) -> PmcResult<(u16, ThresholdStatus)> {
        self.check_channel(ch)?;
        Ok((
            self.regs.read(regs::stat(regs::RAW_READING, ch)) as u16,
            ThresholdStatus::from_bits_truncate(
                self.regs.read(regs::stat(regs::THR_STATUS, ch)) as u8
            ),
        ))
    }

    /// Pending interrupt request word.
    pub fn irq_status(&self) -> u32 {
        self.regs.read(regs::IRQ_REQ)
    }

    /// Acknowledge interrupt request bits.
    pub fn ack_irq(&self, mask: u32) {
        self.regs.write(regs::IRQ_ACK, mask);
    }

    /// Interrupt service path: drain every channel's latched events into the
    /// ISR queue, rearming each observed bit so the same edge is not
    /// re-signaled, and snapshot the raw reading that goes with the event.
    pub fn handle_interrupt(&self) {
        for ch in 0..self.channel_count {
            let assert = EventMask::from_bits_truncate(
                self.regs.read(regs::stat(regs::EV_ASSERT_ST, ch)) as u16,
            );
            let deassert = EventMask::from_bits_truncate(
                self.regs.read(regs::stat(regs::EV_DEASSERT_ST, ch)) as u16,
            );
            if assert.is_empty() && deassert.is_empty() {
                continue;
            }
            let _ = self.rearm(ch, assert, deassert);
            let event = SensorEvent {
                channel: ch,
                reading: self.readouts[ch].read_raw(),
                assert_mask: assert,
                deassert_mask: deassert,
            };
            self.events_received.fetch_add(1, Ordering::Relaxed);
            if self.isrq.try_enqueue(event).is_err() {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.ack_irq(self.irq_status());
        self.isr_queue_highwater
            .fetch_max(self.isrq.len(), Ordering::Relaxed);
    }

    /// Wait up to `timeout_us` for the next event.
    ///
    /// The bounded ISR queue is drained into the in-task deque first, so a
    /// slow consumer cannot make the ISR drop events while earlier ones sit
    /// unread. Single consumer.
    pub fn get_event(&self, timeout_us: u64) -> Option<SensorEvent> {
        let timeout = Timeout::new(&self.clock, timeout_us);
        loop {
            {
                let mut events = self.events.lock();
                while let Some(ev) = self.isrq.try_dequeue() {
                    events.push_back(ev);
                }
                self.userland_queue_highwater
                    .fetch_max(events.len(), Ordering::Relaxed);
                if let Some(ev) = events.pop_front() {
                    self.events_delivered.fetch_add(1, Ordering::Relaxed);
                    return Some(ev);
                }
            }
            if timeout.is_expired() {
                return None;
            }
            core::hint::spin_loop();
        }
    }

    pub fn stats(&self) -> SensorStats {
        SensorStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            isr_queue_highwater: self.isr_queue_highwater.load(Ordering::Relaxed),
            userland_queue_highwater: self.userland_queue_highwater.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::clock::MockClock;
    use crate::drivers::mock::sensor_ip::SimSensorIp;
    use std::sync::Arc;

    const CHANNELS: usize = 4;

    fn processor() -> (SensorProcessor<Arc<SimSensorIp>>, Arc<SimSensorIp>) {
        let ip = Arc::new(SimSensorIp::new(CHANNELS));
        let mut readouts: Vec<Arc<dyn AdcReadout>> = Vec::new();
        for ch in 0..CHANNELS {
            let src = ip.clone();
            readouts.push(Arc::new(move || src.current_raw(ch)));
        }
        let clock = Arc::new(MockClock::with_auto_advance(10));
        (
            SensorProcessor::new(ip.clone(), readouts, clock),
            ip,
        )
    }

    fn configure_unc(sp: &SensorProcessor<Arc<SimSensorIp>>, ch: usize) {
        sp.set_thresholds(
            ch,
            Thresholds {
                unc: 228,
                ucr: 300,
                unr: 400,
                ..Default::default()
            },
        )
        .unwrap();
        sp.set_hysteresis(ch, Hysteresis { pos: 0, neg: 2 }).unwrap();
    }

    fn pump(sp: &SensorProcessor<Arc<SimSensorIp>>, ip: &SimSensorIp, ch: usize, reading: u16) {
        ip.inject_reading(ch, reading);
        sp.handle_interrupt();
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let (sp, _ip) = processor();
        assert_eq!(
            sp.set_hysteresis(CHANNELS, Hysteresis::default()),
            Err(PmcError::InvalidChannel)
        );
        assert_eq!(
            sp.set_thresholds(CHANNELS, Thresholds::default()),
            Err(PmcError::InvalidChannel)
        );
        assert_eq!(
            sp.set_event_enable(CHANNELS, EventMask::empty(), EventMask::empty()),
            Err(PmcError::InvalidChannel)
        );
        assert!(sp.reading(CHANNELS).is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let (sp, _ip) = processor();
        let thr = Thresholds {
            lnc: 10,
            lcr: 5,
            lnr: 2,
            unc: 100,
            ucr: 200,
            unr: 300,
        };
        sp.set_thresholds(1, thr).unwrap();
        assert_eq!(sp.get_thresholds(1).unwrap(), thr);

        let hyst = Hysteresis { pos: 3, neg: 7 };
        sp.set_hysteresis(1, hyst).unwrap();
        assert_eq!(sp.get_hysteresis(1).unwrap(), hyst);
    }

    #[test]
    fn test_threshold_crossing_event_stream() {
        // UNC=228, hyst_neg=2: assert at the 220->229 edge, nothing on the
        // repeat, deassert when the reading drops below 226.
        let (sp, ip) = processor();
        configure_unc(&sp, 0);
        sp.set_event_enable(0, EventMask::UNC_HIGH, EventMask::UNC_HIGH)
            .unwrap();

        pump(&sp, &ip, 0, 220);
        assert_eq!(sp.get_event(0), None);

        pump(&sp, &ip, 0, 229);
        let ev = sp.get_event(0).expect("assert event");
        assert_eq!(ev.channel, 0);
        assert_eq!(ev.reading, 229);
        assert_eq!(ev.assert_mask, EventMask::UNC_HIGH);
        assert!(ev.deassert_mask.is_empty());

        pump(&sp, &ip, 0, 229);
        assert_eq!(sp.get_event(0), None);

        pump(&sp, &ip, 0, 225);
        let ev = sp.get_event(0).expect("deassert event");
        assert_eq!(ev.deassert_mask, EventMask::UNC_HIGH);
        assert!(ev.assert_mask.is_empty());
        assert_eq!(ev.reading, 225);

        pump(&sp, &ip, 0, 224);
        assert_eq!(sp.get_event(0), None);

        let stats = sp.stats();
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.events_delivered, 2);
        assert_eq!(stats.events_dropped, 0);
    }

    #[test]
    fn test_repeated_enable_is_idempotent() {
        // Re-applying an identical enable mask must never produce an event.
        let (sp, ip) = processor();
        configure_unc(&sp, 2);
        sp.set_event_enable(2, EventMask::UNC_HIGH, EventMask::empty())
            .unwrap();
        pump(&sp, &ip, 2, 250);
        assert!(sp.get_event(0).is_some());

        for _ in 0..5 {
            sp.set_event_enable(2, EventMask::UNC_HIGH, EventMask::empty())
                .unwrap();
            sp.handle_interrupt();
            assert_eq!(sp.get_event(0), None);
        }
    }

    #[test]
    fn test_enable_does_not_deliver_stale_condition() {
        // The condition is already true when the bit is first enabled: the
        // stale latch must be rearmed away, not delivered.
        let (sp, ip) = processor();
        configure_unc(&sp, 1);

        pump(&sp, &ip, 1, 250); // crossing latches while disabled
        sp.set_event_enable(1, EventMask::UNC_HIGH, EventMask::UNC_HIGH)
            .unwrap();
        sp.handle_interrupt();
        assert_eq!(sp.get_event(0), None);

        // A fresh crossing after the enable is delivered normally.
        pump(&sp, &ip, 1, 100);
        let _ = sp.get_event(0); // deassert from the drop, if enabled-visible
        pump(&sp, &ip, 1, 240);
        let ev = sp.get_event(0).expect("fresh crossing delivered");
        assert_eq!(ev.assert_mask, EventMask::UNC_HIGH);
    }

    #[test]
    fn test_burst_overflow_is_counted() {
        let (sp, ip) = processor();
        for ch in 0..CHANNELS {
            configure_unc(&sp, ch);
            sp.set_event_enable(ch, EventMask::UNC_HIGH, EventMask::UNC_HIGH)
                .unwrap();
        }
        // Queue holds N + N/2 = 6 events; generate 8 without draining.
        for ch in 0..CHANNELS {
            ip.inject_reading(ch, 250);
            sp.handle_interrupt();
            ip.inject_reading(ch, 100);
            sp.handle_interrupt();
        }
        let stats = sp.stats();
        assert_eq!(stats.events_received, 8);
        assert_eq!(stats.events_dropped, 2);
        assert_eq!(stats.isr_queue_highwater, 6);

        // The six queued events all drain.
        let mut delivered = 0;
        while sp.get_event(0).is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, 6);
    }

    #[test]
    fn test_reading_and_comparison_byte() {
        let (sp, ip) = processor();
        configure_unc(&sp, 3);
        ip.inject_reading(3, 250);
        let (raw, status) = sp.reading(3).unwrap();
        assert_eq!(raw, 250);
        assert!(status.contains(ThresholdStatus::UNC));
        assert!(!status.contains(ThresholdStatus::UCR));
    }

    #[test]
    fn test_get_event_timeout_expires() {
        let (sp, _ip) = processor();
        assert_eq!(sp.get_event(1_000), None);
    }

    #[test]
    fn test_current_status_deassert_word_is_zero() {
        let (sp, ip) = processor();
        configure_unc(&sp, 0);
        ip.inject_reading(0, 250);
        let (assert, deassert) = sp.current_status(0).unwrap();
        assert_eq!(assert, EventMask::UNC_HIGH);
        assert!(deassert.is_empty());
    }

    #[test]
    fn test_distinct_channels_burst() {
        let (sp, ip) = processor();
        for ch in 0..3 {
            configure_unc(&sp, ch);
            sp.set_event_enable(ch, EventMask::UNC_HIGH, EventMask::empty())
                .unwrap();
        }
        for ch in 0..3 {
            ip.inject_reading(ch, 240);
        }
        sp.handle_interrupt();

        let mut seen = vec![false; 3];
        for _ in 0..3 {
            let ev = sp.get_event(0).expect("event per channel");
            seen[ev.channel] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
