//! Variable-size allocation over one storage section.
//!
//! Stores `{length: u16, data: [u8; length]}` in a single section. When the
//! stored blob and a new blob need the same number of pages the allocation
//! is reused in place; otherwise the section is deleted and reallocated.
//! All access is serialized by the helper's own mutex on top of the storage
//! engine's guarantees.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::drivers::traits::Eeprom;
use crate::drivers::{PmcError, PmcResult};
use crate::storage::persistent::PersistentStorage;

/// Record version this helper writes and understands.
const RECORD_VERSION: u16 = 1;

const LENGTH_PREFIX: usize = 2;

pub struct VariableAllocation<E: Eeprom> {
    storage: Arc<PersistentStorage<E>>,
    id: u16,
    mutex: spin::Mutex<()>,
}

impl<E: Eeprom> VariableAllocation<E> {
    pub fn new(storage: Arc<PersistentStorage<E>>, id: u16) -> Self {
        Self {
            storage,
            id,
            mutex: spin::Mutex::new(()),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Current contents; empty if the section has never been written.
    ///
    /// A section written by a different record layout (version other than 1)
    /// is refused rather than misread.
    pub fn get_data(&self) -> PmcResult<Vec<u8>> {
        let _lock = self.mutex.lock();
        match self.storage.get_section_version(self.id) {
            0 => return Ok(Vec::new()),
            RECORD_VERSION => {}
            other => {
                log::error!(
                    "[PSE] variable record {:04x} has unsupported version {}",
                    self.id,
                    other
                );
                return Err(PmcError::VersionMismatch);
            }
        }

        let len = {
            // There is data but the length header cannot be retrieved: the
            // record is corrupt.
            let header = self
                .storage
                .get_section(self.id, RECORD_VERSION, LENGTH_PREFIX)
                .ok_or(PmcError::SizeOverflow)?;
            u16::from_le_bytes([header[0], header[1]]) as usize
        };
        let section = self
            .storage
            .get_section(self.id, RECORD_VERSION, LENGTH_PREFIX + len)
            .ok_or(PmcError::SizeOverflow)?;
        Ok(section[LENGTH_PREFIX..].to_vec())
    }

    /// Replace the contents, scheduling a flush of the written range.
    /// Returns false when the section belongs to another layout or no space
    /// is left.
    pub fn set_data(&self, data: &[u8], completion: Option<Box<dyn FnOnce() + Send>>) -> bool {
        let _lock = self.mutex.lock();
        let version = self.storage.get_section_version(self.id);
        if version != 0 && version != RECORD_VERSION {
            return false;
        }

        let page_size = self.storage.page_size();
        let pages = |bytes: usize| bytes / page_size + usize::from(bytes % page_size != 0);

        let mut reuse = false;
        if version == RECORD_VERSION {
            // Content exists; reuse the allocation if the page count holds.
            if let Some(section) =
                self.storage
                    .get_section(self.id, RECORD_VERSION, LENGTH_PREFIX + data.len())
            {
                let stored = u16::from_le_bytes([section[0], section[1]]) as usize;
                reuse = pages(stored) == pages(data.len());
            }
        }

        if !reuse {
            self.storage.delete_section(self.id);
        }

        let offset = {
            let mut section = match self.storage.get_section(
                self.id,
                RECORD_VERSION,
                LENGTH_PREFIX + data.len(),
            ) {
                Some(section) => section,
                None => return false,
            };
            section[..LENGTH_PREFIX].copy_from_slice(&(data.len() as u16).to_le_bytes());
            section[LENGTH_PREFIX..].copy_from_slice(data);
            section.offset()
        };
        self.storage
            .flush(offset, LENGTH_PREFIX + data.len(), completion)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::clock::MockClock;
    use crate::drivers::mock::eeprom::RamEeprom;
    use crate::storage::persistent::BackgroundScheduler;
    use std::sync::Arc;

    const PAGE: usize = 64;
    const PAGES: usize = 64;

    fn setup() -> (Arc<RamEeprom>, Arc<PersistentStorage<Arc<RamEeprom>>>) {
        let eeprom = Arc::new(RamEeprom::new(PAGE, PAGES));
        let storage = Arc::new(
            PersistentStorage::new(
                eeprom.clone(),
                Arc::new(MockClock::new()),
                Arc::new(BackgroundScheduler),
            )
            .unwrap(),
        );
        (eeprom, storage)
    }

    #[test]
    fn test_empty_until_written() {
        let (_eeprom, storage) = setup();
        let var = VariableAllocation::new(storage, 0x0110);
        assert_eq!(var.get_data().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_set_then_get() {
        let (_eeprom, storage) = setup();
        let var = VariableAllocation::new(storage.clone(), 0x0110);
        assert!(var.set_data(b"fru record contents", None));
        storage.service().unwrap();
        assert_eq!(var.get_data().unwrap(), b"fru record contents");
    }

    #[test]
    fn test_resize_within_page_reuses_allocation() {
        let (_eeprom, storage) = setup();
        let var = VariableAllocation::new(storage.clone(), 0x0111);
        assert!(var.set_data(&[1u8; 10], None));
        let before = storage.list_sections();

        assert!(var.set_data(&[2u8; 20], None));
        let after = storage.list_sections();
        assert_eq!(before, after);
        assert_eq!(var.get_data().unwrap(), [2u8; 20]);
    }

    #[test]
    fn test_resize_across_pages_reallocates() {
        let (_eeprom, storage) = setup();
        let var = VariableAllocation::new(storage.clone(), 0x0112);
        assert!(var.set_data(&[3u8; 10], None));
        let small = storage.list_sections()[0];

        let big_payload = vec![4u8; PAGE * 2];
        assert!(var.set_data(&big_payload, None));
        let big = storage.list_sections()[0];
        assert_ne!(small.pgcount, big.pgcount);
        assert_eq!(var.get_data().unwrap(), big_payload);

        // Shrink back down: reallocates again.
        assert!(var.set_data(&[5u8; 4], None));
        assert_eq!(var.get_data().unwrap(), [5u8; 4]);
    }

    #[test]
    fn test_survives_reboot() {
        let (eeprom, storage) = setup();
        let var = VariableAllocation::new(storage.clone(), 0x0113);
        assert!(var.set_data(b"persistent", None));
        storage.service().unwrap();

        let rebooted = Arc::new(
            PersistentStorage::new(
                eeprom.clone(),
                Arc::new(MockClock::new()),
                Arc::new(BackgroundScheduler),
            )
            .unwrap(),
        );
        let var = VariableAllocation::new(rebooted, 0x0113);
        assert_eq!(var.get_data().unwrap(), b"persistent");
    }

    #[test]
    fn test_foreign_version_refused() {
        let (_eeprom, storage) = setup();
        drop(storage.get_section(0x0114, 9, 8));
        let var = VariableAllocation::new(storage, 0x0114);
        assert_eq!(var.get_data(), Err(PmcError::VersionMismatch));
        assert!(!var.set_data(&[1], None));
    }

    #[test]
    fn test_completion_callback_fires_on_flush() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let (_eeprom, storage) = setup();
        let var = VariableAllocation::new(storage.clone(), 0x0115);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        assert!(var.set_data(&[6u8; 6], Some(Box::new(move || flag.store(true, Ordering::SeqCst)))));
        assert!(!fired.load(Ordering::SeqCst));
        storage.service().unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
