//! RAM-backed EEPROM model
//!
//! Byte-addressed paged storage with write counting (for wear assertions)
//! and failure injection (for flush retry paths). The backing RAM survives
//! as long as the model does, so a "reboot" is simply constructing a new
//! storage service over the same model.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::drivers::traits::Eeprom;
use crate::drivers::{PmcError, PmcResult};

pub struct RamEeprom {
    page_size: usize,
    data: spin::Mutex<Vec<u8>>,
    /// Writes per page, for wear assertions.
    page_writes: spin::Mutex<Vec<u64>>,
    /// Start addresses of successful writes, in order.
    write_log: spin::Mutex<Vec<usize>>,

    read_count: AtomicU64,
    write_count: AtomicU64,
    /// Number of upcoming writes to fail (each consumes one).
    fail_next_writes: AtomicUsize,
}

impl RamEeprom {
    /// Fresh device, erased to 0xFF like a real EEPROM.
    pub fn new(page_size: usize, pages: usize) -> Self {
        Self {
            page_size,
            data: spin::Mutex::new(vec![0xFF; page_size * pages]),
            page_writes: spin::Mutex::new(vec![0; pages]),
            write_log: spin::Mutex::new(Vec::new()),
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            fail_next_writes: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` writes fail (short write of zero bytes).
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next_writes.store(n, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// How many times `page` has been written.
    pub fn writes_to_page(&self, page: usize) -> u64 {
        self.page_writes.lock()[page]
    }

    /// Start addresses of every successful write, oldest first.
    pub fn write_log(&self) -> Vec<usize> {
        self.write_log.lock().clone()
    }

    /// Raw image snapshot (for corruption checks in tests).
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Overwrite the raw image, e.g. to seed a pre-existing layout.
    pub fn load_image(&self, image: &[u8]) {
        let mut data = self.data.lock();
        let len = image.len().min(data.len());
        data[..len].copy_from_slice(&image[..len]);
    }
}

impl Eeprom for RamEeprom {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn total_size(&self) -> usize {
        self.data.lock().len()
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> PmcResult<()> {
        let data = self.data.lock();
        if addr + buf.len() > data.len() {
            return Err(PmcError::SizeOverflow);
        }
        buf.copy_from_slice(&data[addr..addr + buf.len()]);
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, addr: usize, bytes: &[u8]) -> usize {
        if self
            .fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return 0;
        }
        let mut data = self.data.lock();
        if addr + bytes.len() > data.len() {
            return 0;
        }
        data[addr..addr + bytes.len()].copy_from_slice(bytes);
        self.write_count.fetch_add(1, Ordering::Relaxed);

        let mut page_writes = self.page_writes.lock();
        let first = addr / self.page_size;
        let last = (addr + bytes.len().max(1) - 1) / self.page_size;
        for page in first..=last {
            page_writes[page] += 1;
        }
        self.write_log.lock().push(addr);
        bytes.len()
    }
}
