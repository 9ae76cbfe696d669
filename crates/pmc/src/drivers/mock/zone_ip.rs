//! Behavioral model of the management zone controller IP.
//!
//! Models the fabric sequencer: a power-on command starts a counter from
//! zero and each owned pin asserts when the counter reaches its delay; a
//! power-off command counts down from the sequence-timer maximum and each
//! pin deasserts when the counter falls to its delay. Faults (hardware lines
//! through the zone mask, or the soft-fault register) drop every owned pin
//! immediately, except inside the configured holdoff window after a
//! power-on. Zone completion and fault shutdown set the zone's IRQ status
//! bit.
//!
//! Time is driven explicitly through [`SimZoneIp::advance_ms`].

use alloc::vec;
use alloc::vec::Vec;

use crate::drivers::traits::RegisterIo;

const CORE_CLK_PER_MS: u32 = 50_000_000 / 1000;

// Register map of the IP (mirrors the driver's view).
const HARD_FAULT_STATUS_0: usize = 0x000;
const HARD_FAULT_STATUS_1: usize = 0x004;
const IRQ_STATUS: usize = 0x008;
const IRQ_EN: usize = 0x00C;
const IRQ_ACK: usize = 0x010;
const PWR_EN_AGGR_STATUS: usize = 0x014;
const SEQ_TIMER_MAX: usize = 0x018;

const PIN_BASE: usize = 0x020;
const PIN_STRIDE: usize = 16;
const PIN_CFG_0: usize = 0;
const PIN_CFG_1: usize = 4;
const PIN_INDIV_STATUS: usize = 8;

const PWR_EN_OVRD: usize = 0x200;
const PWR_EN_OVRD_DRIVE: usize = 0x204;
const PWR_EN_OVRD_LVL: usize = 0x208;
const PWR_EN_OVRD_READ: usize = 0x20C;

const ZONE_BASE: usize = 0x400;
const ZONE_STRIDE: usize = 32;
const ZONE_PWR_STATUS: usize = 0;
const ZONE_HARD_FAULT_MASK_0: usize = 4;
const ZONE_HARD_FAULT_MASK_1: usize = 8;
const ZONE_HOLDOFF: usize = 12;
const ZONE_SOFT_FAULT: usize = 16;
const ZONE_PWR_ON_INIT: usize = 20;
const ZONE_PWR_OFF_INIT: usize = 24;

const STATE_OFF: u32 = 0;
const STATE_TRANS_OFF: u32 = 1;
const STATE_TRANS_ON: u32 = 2;
const STATE_ON: u32 = 3;

#[derive(Clone, Copy, Default)]
struct Pin {
    cfg0_ticks: u32,
    cfg1: u32,
    asserted: bool,
    state: u32,
}

impl Pin {
    fn owned_by(&self, zone: usize) -> bool {
        self.cfg1 & 0xFFFF & (1 << zone) != 0
    }
}

#[derive(Clone, Copy)]
enum Sequence {
    On { elapsed_ms: u32 },
    Off { elapsed_ms: u32 },
}

#[derive(Clone, Copy, Default)]
struct Zone {
    hf_mask: u64,
    holdoff_ticks: u32,
    seq: Option<Sequence>,
    /// Simulation time of the last power-on command, for the holdoff
    /// window.
    poweron_at_ms: Option<u64>,
}

struct State {
    now_ms: u64,
    pins: Vec<Pin>,
    zones: Vec<Zone>,
    seq_timer_max_ticks: u32,
    hard_faults: u64,
    irq_status: u32,
    irq_en: u32,
    ovrd: u32,
    ovrd_drive: u32,
    ovrd_lvl: u32,
    input_levels: u32,
}

/// Behavioral management zone controller IP.
pub struct SimZoneIp {
    state: spin::Mutex<State>,
}

impl SimZoneIp {
    pub fn new(zone_count: usize, pin_count: usize) -> Self {
        Self {
            state: spin::Mutex::new(State {
                now_ms: 0,
                pins: vec![Pin::default(); pin_count],
                zones: vec![Zone::default(); zone_count],
                seq_timer_max_ticks: 0,
                hard_faults: 0,
                irq_status: 0,
                irq_en: 0,
                ovrd: 0,
                ovrd_drive: 0,
                ovrd_lvl: 0,
                input_levels: 0,
            }),
        }
    }

    /// Drive or release one of the 64 hard-fault input lines.
    pub fn set_hard_fault(&self, line: usize, active: bool) {
        let mut state = self.state.lock();
        if active {
            state.hard_faults |= 1 << line;
        } else {
            state.hard_faults &= !(1 << line);
        }
    }

    /// Raw pin input levels returned through the override-read register.
    pub fn set_input_levels(&self, levels: u32) {
        self.state.lock().input_levels = levels;
    }

    /// Step simulated time forward one millisecond at a time, evaluating
    /// sequencers and fault interlocks on each step.
    pub fn advance_ms(&self, ms: u32) {
        let mut state = self.state.lock();
        for _ in 0..ms {
            state.now_ms += 1;
            Self::step(&mut state);
        }
    }

    fn step(state: &mut State) {
        for z in 0..state.zones.len() {
            let seq = state.zones[z].seq;
            match seq {
                Some(Sequence::On { elapsed_ms }) => {
                    let elapsed_ms = elapsed_ms + 1;
                    let elapsed_ticks = elapsed_ms.saturating_mul(CORE_CLK_PER_MS);
                    let mut all_on = true;
                    for pin in state.pins.iter_mut().filter(|p| p.owned_by(z)) {
                        if elapsed_ticks >= pin.cfg0_ticks {
                            pin.asserted = true;
                            pin.state = STATE_ON;
                        } else {
                            all_on = false;
                        }
                    }
                    if all_on {
                        state.zones[z].seq = None;
                        state.irq_status |= 1 << z;
                    } else {
                        state.zones[z].seq = Some(Sequence::On { elapsed_ms });
                    }
                }
                Some(Sequence::Off { elapsed_ms }) => {
                    let elapsed_ms = elapsed_ms + 1;
                    let elapsed_ticks = elapsed_ms.saturating_mul(CORE_CLK_PER_MS);
                    let countdown = state.seq_timer_max_ticks.saturating_sub(elapsed_ticks);
                    let mut all_off = true;
                    for pin in state.pins.iter_mut().filter(|p| p.owned_by(z)) {
                        if countdown <= pin.cfg0_ticks {
                            pin.asserted = false;
                            pin.state = STATE_OFF;
                        }
                        if pin.state != STATE_OFF {
                            all_off = false;
                        }
                    }
                    if all_off {
                        state.zones[z].seq = None;
                        state.irq_status |= 1 << z;
                    } else {
                        state.zones[z].seq = Some(Sequence::Off { elapsed_ms });
                    }
                }
                None => {}
            }

            // Fault interlock: enabled hard faults kill the zone once the
            // holdoff window from the last power-on has passed.
            let zone = state.zones[z];
            if state.hard_faults & zone.hf_mask != 0 {
                let holdoff_ms = (zone.holdoff_ticks / CORE_CLK_PER_MS) as u64;
                let in_holdoff = zone
                    .poweron_at_ms
                    .map(|t0| state.now_ms < t0 + holdoff_ms)
                    .unwrap_or(false);
                if !in_holdoff {
                    Self::kill_zone(state, z);
                }
            }
        }
    }

    fn kill_zone(state: &mut State, z: usize) {
        let mut was_live = false;
        for pin in state.pins.iter_mut().filter(|p| p.owned_by(z)) {
            if pin.state != STATE_OFF {
                was_live = true;
            }
            pin.asserted = false;
            pin.state = STATE_OFF;
        }
        if was_live {
            state.zones[z].seq = None;
            state.irq_status |= 1 << z;
        }
    }

    fn zone_status(state: &State, z: usize) -> u32 {
        let mut on = false;
        let mut trans_on = false;
        let mut trans_off = false;
        for pin in state.pins.iter().filter(|p| p.owned_by(z)) {
            match pin.state {
                STATE_ON => on = true,
                STATE_TRANS_ON => trans_on = true,
                STATE_TRANS_OFF => trans_off = true,
                _ => {}
            }
        }
        if trans_on {
            STATE_TRANS_ON
        } else if trans_off {
            STATE_TRANS_OFF
        } else if on {
            STATE_ON
        } else {
            STATE_OFF
        }
    }
}

impl RegisterIo for SimZoneIp {
    fn read(&self, offset: usize) -> u32 {
        let state = self.state.lock();
        match offset {
            HARD_FAULT_STATUS_0 => state.hard_faults as u32,
            HARD_FAULT_STATUS_1 => (state.hard_faults >> 32) as u32,
            IRQ_STATUS => state.irq_status,
            IRQ_EN => state.irq_en,
            PWR_EN_AGGR_STATUS => {
                let mut levels = 0u32;
                for (i, pin) in state.pins.iter().enumerate() {
                    if pin.asserted {
                        levels |= 1 << i;
                    }
                }
                levels
            }
            SEQ_TIMER_MAX => state.seq_timer_max_ticks,
            PWR_EN_OVRD => state.ovrd,
            PWR_EN_OVRD_DRIVE => state.ovrd_drive,
            PWR_EN_OVRD_LVL => state.ovrd_lvl,
            PWR_EN_OVRD_READ => state.input_levels,
            _ if offset >= ZONE_BASE => {
                let z = (offset - ZONE_BASE) / ZONE_STRIDE;
                if z >= state.zones.len() {
                    return 0;
                }
                match (offset - ZONE_BASE) % ZONE_STRIDE {
                    ZONE_PWR_STATUS => Self::zone_status(&state, z),
                    ZONE_HARD_FAULT_MASK_0 => state.zones[z].hf_mask as u32,
                    ZONE_HARD_FAULT_MASK_1 => (state.zones[z].hf_mask >> 32) as u32,
                    ZONE_HOLDOFF => state.zones[z].holdoff_ticks,
                    _ => 0,
                }
            }
            _ if offset >= PIN_BASE && offset < PWR_EN_OVRD => {
                let p = (offset - PIN_BASE) / PIN_STRIDE;
                if p >= state.pins.len() {
                    return 0;
                }
                match (offset - PIN_BASE) % PIN_STRIDE {
                    PIN_CFG_0 => state.pins[p].cfg0_ticks,
                    PIN_CFG_1 => state.pins[p].cfg1,
                    PIN_INDIV_STATUS => state.pins[p].state,
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        match offset {
            IRQ_EN => state.irq_en = value,
            IRQ_ACK => state.irq_status &= !value,
            SEQ_TIMER_MAX => state.seq_timer_max_ticks = value,
            PWR_EN_OVRD => state.ovrd = value,
            PWR_EN_OVRD_DRIVE => state.ovrd_drive = value,
            PWR_EN_OVRD_LVL => state.ovrd_lvl = value,
            _ if offset >= ZONE_BASE => {
                let z = (offset - ZONE_BASE) / ZONE_STRIDE;
                if z >= state.zones.len() {
                    return;
                }
                match (offset - ZONE_BASE) % ZONE_STRIDE {
                    ZONE_HARD_FAULT_MASK_0 => {
                        state.zones[z].hf_mask =
                            (state.zones[z].hf_mask & !0xFFFF_FFFF) | value as u64
                    }
                    ZONE_HARD_FAULT_MASK_1 => {
                        state.zones[z].hf_mask =
                            (state.zones[z].hf_mask & 0xFFFF_FFFF) | ((value as u64) << 32)
                    }
                    ZONE_HOLDOFF => state.zones[z].holdoff_ticks = value,
                    ZONE_SOFT_FAULT => {
                        for zz in 0..state.zones.len() {
                            if value & (1 << zz) != 0 {
                                Self::kill_zone(&mut state, zz);
                            }
                        }
                    }
                    ZONE_PWR_ON_INIT => {
                        for zz in 0..state.zones.len() {
                            if value & (1 << zz) == 0 {
                                continue;
                            }
                            let now = state.now_ms;
                            state.zones[zz].seq = Some(Sequence::On { elapsed_ms: 0 });
                            state.zones[zz].poweron_at_ms = Some(now);
                            for pin in state.pins.iter_mut().filter(|p| p.owned_by(zz)) {
                                if pin.state != STATE_ON {
                                    pin.state = STATE_TRANS_ON;
                                }
                            }
                        }
                    }
                    ZONE_PWR_OFF_INIT => {
                        for zz in 0..state.zones.len() {
                            if value & (1 << zz) == 0 {
                                continue;
                            }
                            state.zones[zz].seq = Some(Sequence::Off { elapsed_ms: 0 });
                            for pin in state.pins.iter_mut().filter(|p| p.owned_by(zz)) {
                                if pin.asserted {
                                    pin.state = STATE_TRANS_OFF;
                                } else {
                                    pin.state = STATE_OFF;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ if offset >= PIN_BASE && offset < PWR_EN_OVRD => {
                let p = (offset - PIN_BASE) / PIN_STRIDE;
                if p >= state.pins.len() {
                    return;
                }
                match (offset - PIN_BASE) % PIN_STRIDE {
                    PIN_CFG_0 => state.pins[p].cfg0_ticks = value,
                    PIN_CFG_1 => state.pins[p].cfg1 = value,
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configure_pin(ip: &SimZoneIp, pin: usize, zone: usize, delay_ms: u32) {
        ip.write(PIN_BASE + pin * PIN_STRIDE + PIN_CFG_0, delay_ms * CORE_CLK_PER_MS);
        // active high, drive enable, owned by `zone`
        ip.write(
            PIN_BASE + pin * PIN_STRIDE + PIN_CFG_1,
            (3 << 16) | (1 << zone),
        );
    }

    #[test]
    fn test_on_sequence_asserts_in_delay_order() {
        let ip = SimZoneIp::new(4, 8);
        configure_pin(&ip, 0, 1, 10);
        configure_pin(&ip, 1, 1, 30);
        ip.write(SEQ_TIMER_MAX, 30 * CORE_CLK_PER_MS);

        ip.write(ZONE_BASE + ZONE_STRIDE + ZONE_PWR_ON_INIT, 1 << 1);
        assert_eq!(ip.read(ZONE_BASE + ZONE_STRIDE + ZONE_PWR_STATUS), STATE_TRANS_ON);

        ip.advance_ms(15);
        assert_eq!(ip.read(PWR_EN_AGGR_STATUS), 1 << 0);

        ip.advance_ms(15);
        assert_eq!(ip.read(PWR_EN_AGGR_STATUS), 0b11);
        assert_eq!(ip.read(ZONE_BASE + ZONE_STRIDE + ZONE_PWR_STATUS), STATE_ON);
        assert_ne!(ip.read(IRQ_STATUS) & (1 << 1), 0);
    }

    #[test]
    fn test_soft_fault_is_immediate() {
        let ip = SimZoneIp::new(2, 2);
        configure_pin(&ip, 0, 0, 1);
        ip.write(SEQ_TIMER_MAX, CORE_CLK_PER_MS);
        ip.write(ZONE_BASE + ZONE_PWR_ON_INIT, 1);
        ip.advance_ms(1);
        assert_eq!(ip.read(PWR_EN_AGGR_STATUS), 1);

        ip.write(ZONE_BASE + ZONE_SOFT_FAULT, 1);
        assert_eq!(ip.read(PWR_EN_AGGR_STATUS), 0);
        assert_eq!(ip.read(ZONE_BASE + ZONE_PWR_STATUS), STATE_OFF);
    }

    #[test]
    fn test_irq_ack_clears() {
        let ip = SimZoneIp::new(2, 2);
        configure_pin(&ip, 0, 0, 1);
        ip.write(ZONE_BASE + ZONE_PWR_ON_INIT, 1);
        ip.advance_ms(2);
        assert_ne!(ip.read(IRQ_STATUS), 0);
        ip.write(IRQ_ACK, u32::MAX);
        assert_eq!(ip.read(IRQ_STATUS), 0);
    }
}
