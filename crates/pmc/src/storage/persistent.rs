//! Page-cached persistent storage engine
//!
//! Keeps two full mirrors of the EEPROM in RAM: `cache` (what is on the
//! device) and `data` (what will be after the next flush), separated by a
//! canary word that detects overruns of the region. Consumers read and write
//! `data` through versioned, size-checked section views; the flush engine
//! writes back only pages whose bytes actually differ, which is what keeps
//! EEPROM wear proportional to real change.
//!
//! Flushes are queued, not immediate. The queue is a priority order:
//!
//! 1. index flushes (the section directory must hit the device before the
//!    payloads it describes are meaningful);
//! 2. requests with a completion callback, by requesting task priority;
//!    these have a blocked caller, and the flush worker inherits their
//!    priority through the [`FlushScheduler`] hooks;
//! 3. everything else, oldest first.
//!
//! A queued index flush is elevated to the priority of any newer
//! callback-bearing request, so a high-priority flush can never be stuck
//! behind a background directory write.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering as CmpOrdering;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::drivers::traits::{Eeprom, WatchdogSlot};
use crate::drivers::{PmcError, PmcResult};
use crate::storage::RESERVED_END_OF_INDEX;
use crate::time::Clock;

/// Sentinel between the two RAM mirrors. Anything else here means the
/// region has been overrun and neither mirror can be trusted.
pub const CANARY: u32 = 0x1234_DEAD;

/// On-device format version this engine reads and writes.
pub const STORAGE_FORMAT_VERSION: u16 = 1;

/// Delay between background full-image flushes.
pub const DEFAULT_FLUSH_PERIOD_US: u64 = 10_000_000;

pub const TASK_PRIORITY_BACKGROUND: u8 = 1;
pub const TASK_PRIORITY_DRIVER: u8 = 4;

const HEADER_LEN: usize = 2;
const INDEX_RECORD_LEN: usize = 8;

/// One entry of the on-image section directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub id: u16,
    pub pgoff: u16,
    pub pgcount: u16,
    pub version: u16,
}

/// Hooks into the task layer: waking the flush worker and adjusting its
/// priority for inheritance. The default implementation is inert, for
/// platforms (and tests) that drive [`PersistentStorage::service`] directly.
pub trait FlushScheduler: Send + Sync {
    /// Priority of the task calling into the storage API.
    fn current_priority(&self) -> u8 {
        TASK_PRIORITY_BACKGROUND
    }

    /// Adjust the flush worker's priority.
    fn set_flush_priority(&self, _priority: u8) {}

    /// Wake the flush worker.
    fn notify(&self) {}
}

/// Inert scheduler for direct-driven deployments.
pub struct BackgroundScheduler;

impl FlushScheduler for BackgroundScheduler {}

fn page_count(size: usize, page_size: usize) -> usize {
    size / page_size + usize::from(size % page_size != 0)
}

fn ranges_overlap(base_a: usize, size_a: usize, base_b: usize, size_b: usize) -> bool {
    base_b < base_a + size_a && base_a < base_b + size_b
}

struct FlushRequest {
    start: usize,
    end: usize,
    process_priority: u8,
    complete: Option<Box<dyn FnOnce() + Send>>,
    requested_at: u64,
    index_flush: bool,
}

impl FlushRequest {
    fn rank(&self) -> u32 {
        let mut rank = 0u32;
        if self.index_flush {
            rank |= 0x8000_0000;
        }
        if self.complete.is_some() {
            rank |= 0x4000_0000 | self.process_priority as u32;
        }
        rank
    }
}

impl PartialEq for FlushRequest {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank() && self.requested_at == other.requested_at
    }
}

impl Eq for FlushRequest {}

impl PartialOrd for FlushRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlushRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher rank first, then older request first.
        self.rank()
            .cmp(&other.rank())
            .then_with(|| other.requested_at.cmp(&self.requested_at))
    }
}

/// The RAM image: `cache | canary | data`, one contiguous allocation so an
/// overrun of either mirror lands on the canary.
struct Image {
    buf: Vec<u8>,
    total: usize,
    page_size: usize,
}

impl Image {
    fn new(total: usize, page_size: usize) -> Self {
        let mut buf = vec![0u8; total * 2 + 4];
        buf[total..total + 4].copy_from_slice(&CANARY.to_le_bytes());
        Self {
            buf,
            total,
            page_size,
        }
    }

    fn canary(&self) -> u32 {
        u32::from_le_bytes(self.buf[self.total..self.total + 4].try_into().unwrap())
    }

    fn data_base(&self) -> usize {
        self.total + 4
    }

    fn cache(&mut self) -> &mut [u8] {
        let total = self.total;
        &mut self.buf[..total]
    }

    fn data(&self) -> &[u8] {
        &self.buf[self.total + 4..]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        let base = self.data_base();
        &mut self.buf[base..]
    }

    fn header_version(&self) -> u16 {
        u16::from_le_bytes(self.data()[..2].try_into().unwrap())
    }

    fn set_header_version(&mut self, version: u16) {
        self.data_mut()[..2].copy_from_slice(&version.to_le_bytes());
    }

    fn record(&self, i: usize) -> IndexRecord {
        let off = HEADER_LEN + i * INDEX_RECORD_LEN;
        let d = self.data();
        let word = |o: usize| u16::from_le_bytes([d[o], d[o + 1]]);
        IndexRecord {
            id: word(off),
            pgoff: word(off + 2),
            pgcount: word(off + 4),
            version: word(off + 6),
        }
    }

    fn set_record(&mut self, i: usize, rec: IndexRecord) {
        let off = HEADER_LEN + i * INDEX_RECORD_LEN;
        let d = self.data_mut();
        d[off..off + 2].copy_from_slice(&rec.id.to_le_bytes());
        d[off + 2..off + 4].copy_from_slice(&rec.pgoff.to_le_bytes());
        d[off + 4..off + 6].copy_from_slice(&rec.pgcount.to_le_bytes());
        d[off + 6..off + 8].copy_from_slice(&rec.version.to_le_bytes());
    }

    /// Number of live records (terminator excluded).
    fn index_len(&self) -> usize {
        let max = (self.total - HEADER_LEN) / INDEX_RECORD_LEN;
        let mut i = 0;
        while i < max && self.record(i).id != RESERVED_END_OF_INDEX {
            i += 1;
        }
        i
    }

    /// Bytes of header plus index including the terminator record.
    fn index_bytes(&self) -> usize {
        HEADER_LEN + (self.index_len() + 1) * INDEX_RECORD_LEN
    }

    fn find(&self, id: u16) -> Option<(usize, IndexRecord)> {
        for i in 0..self.index_len() {
            let rec = self.record(i);
            if rec.id == id {
                return Some((i, rec));
            }
        }
        None
    }
}

/// Writable view of one section, borrowing the storage image. Dereferences
/// to the section's bytes in the `data` mirror; writes become durable on the
/// next flush covering [`Section::offset`].
pub struct Section<'a> {
    guard: spin::MutexGuard<'a, Image>,
    offset: usize,
    len: usize,
}

impl Section<'_> {
    /// Byte offset of this view inside the storage data space, for use with
    /// [`PersistentStorage::flush`].
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Deref for Section<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.data()[self.offset..self.offset + self.len]
    }
}

impl DerefMut for Section<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let (offset, len) = (self.offset, self.len);
        &mut self.guard.data_mut()[offset..offset + len]
    }
}

/// The persistent storage engine over one EEPROM.
pub struct PersistentStorage<E: Eeprom> {
    eeprom: E,
    page_size: usize,
    total_size: usize,
    clock: Arc<dyn Clock>,
    sched: Arc<dyn FlushScheduler>,
    wdt: Option<Box<dyn WatchdogSlot>>,

    image: spin::Mutex<Image>,
    flushq: spin::Mutex<BinaryHeap<FlushRequest>>,
    flush_priority: AtomicU8,
    flush_disabled: AtomicBool,
    next_bg_flush_at_us: AtomicU64,
    flush_period_us: u64,
}

impl<E: Eeprom> PersistentStorage<E> {
    /// Load the EEPROM image and bring the store online, reformatting an
    /// uninitialized or unrecognized image.
    pub fn new(
        eeprom: E,
        clock: Arc<dyn Clock>,
        sched: Arc<dyn FlushScheduler>,
    ) -> PmcResult<Self> {
        let page_size = eeprom.page_size();
        let total_size = eeprom.total_size();
        if page_size == 0 || total_size % page_size != 0 || total_size / page_size > u16::MAX as usize
        {
            return Err(PmcError::SizeOverflow);
        }

        let mut image = Image::new(total_size, page_size);
        eeprom.read(0, image.cache())?;
        let (cache, rest) = image.buf.split_at_mut(total_size);
        rest[4..].copy_from_slice(cache);

        log::info!("[PSE] loaded {} byte image", total_size);

        match image.header_version() {
            0 | 0xFFFF => {
                image.set_header_version(STORAGE_FORMAT_VERSION);
                image.set_record(
                    0,
                    IndexRecord {
                        id: RESERVED_END_OF_INDEX,
                        pgoff: 0,
                        pgcount: 0,
                        version: 0,
                    },
                );
                log::info!("[PSE] first use initialization complete");
            }
            STORAGE_FORMAT_VERSION => {}
            other => {
                log::error!("[PSE] format version {} not recognized, storage REFORMATTED", other);
                image.set_header_version(STORAGE_FORMAT_VERSION);
                image.set_record(
                    0,
                    IndexRecord {
                        id: RESERVED_END_OF_INDEX,
                        pgoff: 0,
                        pgcount: 0,
                        version: 0,
                    },
                );
            }
        }

        let now = clock.now_us();
        let storage = Self {
            eeprom,
            page_size,
            total_size,
            clock,
            sched,
            wdt: None,
            image: spin::Mutex::new(image),
            flushq: spin::Mutex::new(BinaryHeap::new()),
            flush_priority: AtomicU8::new(TASK_PRIORITY_BACKGROUND),
            flush_disabled: AtomicBool::new(false),
            next_bg_flush_at_us: AtomicU64::new(now + DEFAULT_FLUSH_PERIOD_US),
            flush_period_us: DEFAULT_FLUSH_PERIOD_US,
        };
        Ok(storage)
    }

    /// Attach a watchdog slot serviced on every flush pass.
    pub fn with_watchdog(mut self, slot: Box<dyn WatchdogSlot>) -> Self {
        self.wdt = Some(slot);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Version of a stored section, 0 if absent.
    pub fn get_section_version(&self, id: u16) -> u16 {
        let image = self.image.lock();
        image.find(id).map(|(_, rec)| rec.version).unwrap_or(0)
    }

    /// Update a stored section's version and schedule an index flush.
    pub fn set_section_version(&self, id: u16, version: u16) {
        let index_bytes;
        {
            let mut image = self.image.lock();
            for i in 0..image.index_len() {
                let mut rec = image.record(i);
                if rec.id == id {
                    rec.version = version;
                    image.set_record(i, rec);
                    log::info!("[PSE] set section[{:04x}].version = {:04x}", id, version);
                }
            }
            index_bytes = image.index_bytes();
        }
        self.enqueue_index_flush(index_bytes);
    }

    /// Retrieve a writable view of a section, allocating on first use.
    ///
    /// Returns `None` when the stored version does not match, when the
    /// stored allocation is smaller than `size`, or when no contiguous page
    /// range is left for a new section. The view holds the image lock; drop
    /// it before calling any other storage operation.
    pub fn get_section(&self, id: u16, version: u16, size: usize) -> Option<Section<'_>> {
        if id == RESERVED_END_OF_INDEX {
            log::error!("[PSE] the reserved end-of-index id cannot be requested");
            return None;
        }

        let pgcount = page_count(size, self.page_size);
        let mut image = self.image.lock();

        if let Some((_, rec)) = image.find(id) {
            if rec.version != version {
                log::error!(
                    "[PSE] version mismatch retrieving section {:04x}: {} requested, {} present",
                    id,
                    version,
                    rec.version
                );
                return None;
            }
            if (rec.pgcount as usize) < pgcount {
                log::error!(
                    "[PSE] size mismatch retrieving section {:04x}: {} pages requested, {} present",
                    id,
                    pgcount,
                    rec.pgcount
                );
                return None;
            }
            let offset = rec.pgoff as usize * self.page_size;
            return Some(Section {
                guard: image,
                offset,
                len: size,
            });
        }

        // Absent: allocate. Sections are placed first-fit from the top of
        // the EEPROM, walking down past whatever they overlap, and must stay
        // above the index including the record being added plus a fresh
        // terminator.
        let count = image.index_len();
        let minimum_address = HEADER_LEN + (count + 2) * INDEX_RECORD_LEN;
        let minimum_page = page_count(minimum_address, self.page_size);
        let total_pages = self.total_size / self.page_size;

        if pgcount > total_pages {
            log::error!("[PSE] unable to allocate {} pages for section {:04x}", pgcount, id);
            return None;
        }

        let mut allocpg = total_pages - pgcount;
        let mut potential_overlap = true;
        while allocpg >= minimum_page && potential_overlap {
            potential_overlap = false;
            for x in 0..count {
                let other = image.record(x);
                if ranges_overlap(
                    allocpg,
                    pgcount,
                    other.pgoff as usize,
                    other.pgcount as usize,
                ) {
                    potential_overlap = true;
                    if (other.pgoff as usize) < pgcount {
                        // No room below this section; exit through the
                        // failure path.
                        allocpg = 0;
                    } else {
                        allocpg = other.pgoff as usize - pgcount;
                    }
                }
            }
        }

        if allocpg < minimum_page {
            log::error!(
                "[PSE] unable to allocate {} contiguous pages for section {:04x}",
                pgcount,
                id
            );
            return None;
        }

        let rec = IndexRecord {
            id,
            pgoff: allocpg as u16,
            pgcount: pgcount as u16,
            version,
        };
        image.set_record(count, rec);
        image.set_record(
            count + 1,
            IndexRecord {
                id: RESERVED_END_OF_INDEX,
                pgoff: 0,
                pgcount: 0,
                version: 0,
            },
        );
        log::debug!(
            "[PSE] section[{:04x}] (version {}) allocated at page {:#x} for {} pages",
            id,
            version,
            allocpg,
            pgcount
        );
        let index_bytes = image.index_bytes();
        let offset = allocpg * self.page_size;
        // Hand the view out first, then queue the index write.
        let section = Section {
            guard: image,
            offset,
            len: size,
        };
        self.enqueue_index_flush(index_bytes);
        Some(section)
    }

    /// Remove every record of `id` from the index. Pages are not zeroed.
    pub fn delete_section(&self, id: u16) {
        let index_bytes;
        {
            let mut image = self.image.lock();
            let mut i = 0;
            while image.record(i).id != RESERVED_END_OF_INDEX {
                if image.record(i).id == id {
                    let rec = image.record(i);
                    log::info!(
                        "[PSE] deleting section {:04x} (version {}) at page {:#x}, freeing {} pages",
                        rec.id,
                        rec.version,
                        rec.pgoff,
                        rec.pgcount
                    );
                    let mut x = i;
                    loop {
                        let next = image.record(x + 1);
                        image.set_record(x, next);
                        if next.id == RESERVED_END_OF_INDEX {
                            break;
                        }
                        x += 1;
                    }
                } else {
                    i += 1;
                }
            }
            index_bytes = image.index_bytes();
        }
        self.enqueue_index_flush(index_bytes);
    }

    /// All live index records.
    pub fn list_sections(&self) -> Vec<IndexRecord> {
        let image = self.image.lock();
        (0..image.index_len()).map(|i| image.record(i)).collect()
    }

    /// Mark the image uninitialized; it reformats on the next boot.
    pub fn deinitialize(&self) {
        let index_bytes;
        {
            let mut image = self.image.lock();
            image.set_header_version(0xFFFF);
            index_bytes = image.index_bytes();
            log::warn!("[PSE] storage marked for reinitialization");
        }
        self.enqueue_index_flush(index_bytes);
    }

    /// Queue a flush of the whole image.
    pub fn flush_all(&self, completion: Option<Box<dyn FnOnce() + Send>>) {
        let _ = self.flush(0, self.total_size, completion);
    }

    /// Queue a flush of `[start, start+len)` of the data space. With a
    /// completion callback the caller is assumed blocked on it, and the
    /// flush worker inherits the caller's priority until the request
    /// completes.
    pub fn flush(
        &self,
        start: usize,
        len: usize,
        completion: Option<Box<dyn FnOnce() + Send>>,
    ) -> PmcResult<()> {
        if start + len > self.total_size {
            log::error!("[PSE] flush range [{}, {}) exceeds storage", start, start + len);
            return Err(PmcError::SizeOverflow);
        }
        log::debug!("[PSE] requesting flush of range [{}, {})", start, start + len);

        let priority = self.sched.current_priority();
        let has_callback = completion.is_some();
        {
            let mut flushq = self.flushq.lock();
            // An index flush sitting on top must not lose to the new
            // blocked request: elevate it first.
            if has_callback {
                if let Some(top) = flushq.peek() {
                    if top.index_flush && top.process_priority < priority {
                        let mut index_req = flushq.pop().unwrap();
                        index_req.process_priority = priority;
                        flushq.push(index_req);
                    }
                }
            }
            flushq.push(FlushRequest {
                start,
                end: start + len,
                process_priority: priority,
                complete: completion,
                requested_at: self.clock.now_us(),
                index_flush: false,
            });
        }

        if has_callback && priority > self.flush_priority.load(Ordering::Acquire) {
            self.flush_priority.store(priority, Ordering::Release);
            self.sched.set_flush_priority(priority);
        }
        self.sched.notify();
        Ok(())
    }

    /// Queue a flush of the header and index area.
    pub fn flush_index(&self) {
        let index_bytes = self.image.lock().index_bytes();
        self.enqueue_index_flush(index_bytes);
    }

    fn enqueue_index_flush(&self, index_bytes: usize) {
        log::debug!("[PSE] requesting flush of index ({} bytes)", index_bytes);
        let mut flushq = self.flushq.lock();
        let top_is_index = flushq.peek().map(|r| r.index_flush).unwrap_or(false);
        if top_is_index {
            // Extend the queued index flush rather than queueing another.
            let mut existing = flushq.pop().unwrap();
            existing.end = existing.end.max(index_bytes);
            flushq.push(existing);
        } else {
            let mut priority = self.sched.current_priority();
            if let Some(top) = flushq.peek() {
                // Inherit so nobody's job is deprioritized behind us.
                priority = priority.max(top.process_priority);
            }
            flushq.push(FlushRequest {
                start: 0,
                end: index_bytes,
                process_priority: priority,
                complete: None,
                requested_at: self.clock.now_us(),
                index_flush: true,
            });
        }
        drop(flushq);
        self.sched.notify();
    }

    /// Queue the periodic background full-image flush when it is due.
    /// Returns true if a request was queued.
    pub fn background_tick(&self) -> bool {
        let now = self.clock.now_us();
        let due = self.next_bg_flush_at_us.load(Ordering::Acquire);
        if now < due {
            return false;
        }
        self.next_bg_flush_at_us
            .store(now + self.flush_period_us, Ordering::Release);
        self.flushq.lock().push(FlushRequest {
            start: 0,
            end: self.total_size,
            process_priority: TASK_PRIORITY_BACKGROUND,
            complete: None,
            requested_at: now,
            index_flush: false,
        });
        true
    }

    /// Drain the flush queue: the body of the flush worker.
    ///
    /// Each pass verifies the canary, writes back differing pages of the
    /// highest-priority request, services the watchdog slot and fires the
    /// request's completion callback. Returns whether any page reached the
    /// device. After a canary failure every call fails without touching the
    /// EEPROM again.
    pub fn service(&self) -> PmcResult<bool> {
        if self.flush_disabled.load(Ordering::Acquire) {
            return Err(PmcError::CanaryCorrupted);
        }

        let mut changed = false;
        loop {
            self.check_canary()?;

            let request = self.flushq.lock().pop();
            let Some(mut request) = request else {
                self.set_flush_priority(TASK_PRIORITY_BACKGROUND);
                break;
            };

            // Inherit while someone is blocked on this request, drop to
            // background otherwise.
            if request.complete.is_some() || request.index_flush {
                self.set_flush_priority(request.process_priority);
            } else {
                self.set_flush_priority(TASK_PRIORITY_BACKGROUND);
            }

            if self.flush_range(request.start, request.end) {
                changed = true;
            }

            if let Some(wdt) = &self.wdt {
                wdt.service();
            }

            if let Some(complete) = request.complete.take() {
                complete();
            }
        }

        if changed {
            log::info!("[PSE] changes flushed to EEPROM");
        }
        Ok(changed)
    }

    fn set_flush_priority(&self, priority: u8) {
        if self.flush_priority.swap(priority, Ordering::AcqRel) != priority {
            self.sched.set_flush_priority(priority);
        }
    }

    fn check_canary(&self) -> PmcResult<()> {
        if self.image.lock().canary() != CANARY {
            log::error!(
                "[PSE] canary INVALID: buffer overrun near the storage mirrors, flushes permanently disabled"
            );
            self.flush_disabled.store(true, Ordering::Release);
            return Err(PmcError::CanaryCorrupted);
        }
        Ok(())
    }

    /// Write back every differing page in `[start, end)`, rounded out to
    /// page boundaries. A failed page write leaves the cache mirror alone so
    /// the next cycle retries it.
    fn flush_range(&self, start: usize, end: usize) -> bool {
        let start = start - start % self.page_size;
        let end = end
            .checked_add(self.page_size - 1)
            .map(|e| (e / self.page_size) * self.page_size)
            .unwrap_or(self.total_size)
            .min(self.total_size);

        let mut changed = false;
        let mut page = vec![0u8; self.page_size];
        let mut addr = start;
        while addr < end {
            let dirty = {
                let image = self.image.lock();
                let base = image.data_base();
                let data_page = &image.buf[base + addr..base + addr + self.page_size];
                let cache_page = &image.buf[addr..addr + self.page_size];
                if data_page == cache_page {
                    false
                } else {
                    page.copy_from_slice(data_page);
                    true
                }
            };

            if dirty {
                log::trace!("[PSE] difference found at {:#x}", addr);
                if self.eeprom.write(addr, &page) != self.page_size {
                    log::error!("[PSE] EEPROM write failed during flush at {:#06x}", addr);
                } else {
                    let mut image = self.image.lock();
                    image.buf[addr..addr + self.page_size].copy_from_slice(&page);
                    changed = true;
                }
            }
            addr += self.page_size;
        }
        changed
    }

    /// Number of queued flush requests (diagnostics).
    pub fn pending_flushes(&self) -> usize {
        self.flushq.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_canary_for_test(&self) {
        let mut image = self.image.lock();
        let total = image.total;
        image.buf[total..total + 4].copy_from_slice(&0xDEAD_0000u32.to_le_bytes());
    }
}
