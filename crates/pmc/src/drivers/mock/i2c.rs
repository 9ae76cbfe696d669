//! Recording I2C station model.
//!
//! Captures every operation the transceiver performs so tests can assert
//! role-switch sequences, and exposes the frames handed to `master_send`.
//! Completion events are injected by the test through
//! `IpmbTransceiver::handle_status`, exactly as the controller ISR would.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::drivers::traits::I2cStation;

/// One recorded controller operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Reset,
    SetClockHz(u32),
    SetupSlave(u8),
    SlaveReceive(usize),
    MasterSend { len: usize, addr: u8 },
}

#[derive(Default)]
struct State {
    ops: Vec<BusOp>,
    sent_frames: Vec<(Vec<u8>, u8)>,
    busy: bool,
}

/// Shared-handle recording station; clones observe the same device.
#[derive(Clone)]
pub struct MockI2cStation {
    state: Arc<spin::Mutex<State>>,
}

impl MockI2cStation {
    pub fn new() -> Self {
        Self {
            state: Arc::new(spin::Mutex::new(State::default())),
        }
    }

    /// All operations performed since the last `clear_ops`.
    pub fn ops(&self) -> Vec<BusOp> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    /// Frames passed to `master_send` with their 7-bit target addresses.
    pub fn sent_frames(&self) -> Vec<(Vec<u8>, u8)> {
        self.state.lock().sent_frames.clone()
    }

    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }
}

impl Default for MockI2cStation {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cStation for MockI2cStation {
    fn bus_is_busy(&self) -> bool {
        self.state.lock().busy
    }

    fn reset(&self) {
        self.state.lock().ops.push(BusOp::Reset);
    }

    fn set_clock_hz(&self, hz: u32) {
        self.state.lock().ops.push(BusOp::SetClockHz(hz));
    }

    fn setup_slave(&self, own_addr: u8) {
        self.state.lock().ops.push(BusOp::SetupSlave(own_addr));
    }

    fn slave_receive(&self, max_len: usize) {
        self.state.lock().ops.push(BusOp::SlaveReceive(max_len));
    }

    fn master_send(&self, bytes: &[u8], slave_addr: u8) {
        let mut state = self.state.lock();
        state.ops.push(BusOp::MasterSend {
            len: bytes.len(),
            addr: slave_addr,
        });
        state.sent_frames.push((bytes.to_vec(), slave_addr));
    }
}
