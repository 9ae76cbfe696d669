//! Slot-based software watchdog
//!
//! Long-lived service tasks each register a slot with their own deadline;
//! the platform's hardware watchdog feeder only feeds while every active
//! slot has been serviced within its timeout. A background task like the
//! storage flush engine gets a generous deadline but is still guaranteed to
//! be noticed if it wedges.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::drivers::traits::WatchdogSlot;
use crate::time::Clock;

struct Slot {
    name: &'static str,
    timeout_us: u64,
    deadline_us: u64,
    active: bool,
}

/// Software watchdog multiplexing one hardware timer across service slots.
pub struct SlotWatchdog {
    clock: Arc<dyn Clock>,
    slots: spin::Mutex<Vec<Slot>>,
}

/// Handle identifying a registered slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotId(usize);

impl SlotWatchdog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: spin::Mutex::new(Vec::new()),
        }
    }

    /// Register a slot that must be serviced at least every `timeout_us`.
    /// The slot starts inactive.
    pub fn register_slot(&self, name: &'static str, timeout_us: u64) -> SlotId {
        let mut slots = self.slots.lock();
        slots.push(Slot {
            name,
            timeout_us,
            deadline_us: 0,
            active: false,
        });
        SlotId(slots.len() - 1)
    }

    /// Arm a slot; its deadline starts from now.
    pub fn activate_slot(&self, id: SlotId) {
        let now = self.clock.now_us();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(id.0) {
            slot.active = true;
            slot.deadline_us = now + slot.timeout_us;
        }
    }

    /// Service a slot, pushing its deadline out by its timeout.
    pub fn service_slot(&self, id: SlotId) {
        let now = self.clock.now_us();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(id.0) {
            slot.deadline_us = now + slot.timeout_us;
        }
    }

    /// Name of the first active slot past its deadline, if any. The hardware
    /// feeder polls this and stops feeding when it returns `Some`.
    pub fn expired_slot(&self) -> Option<&'static str> {
        let now = self.clock.now_us();
        let slots = self.slots.lock();
        for slot in slots.iter() {
            if slot.active && now > slot.deadline_us {
                log::error!("[WDT] slot '{}' missed its {} us deadline", slot.name, slot.timeout_us);
                return Some(slot.name);
            }
        }
        None
    }
}

/// A single slot bound to its watchdog, usable as a `WatchdogSlot` object.
pub struct SlotHandle {
    wdt: Arc<SlotWatchdog>,
    id: SlotId,
}

impl SlotHandle {
    pub fn new(wdt: Arc<SlotWatchdog>, id: SlotId) -> Self {
        Self { wdt, id }
    }
}

impl WatchdogSlot for SlotHandle {
    fn service(&self) {
        self.wdt.service_slot(self.id);
    }
}
