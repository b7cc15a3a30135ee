//! Table of simulated instructions whose probes may fault, and where each should resume.
//!
//! The table is read from the fault handler, which cannot take locks or allocate. Writers
//! therefore never mutate a published table: they build a new sorted copy under the writer
//! lock, swap it in, and only free the old copy once no reader can still be inside it.
//!
//! Readers announce themselves in one of two counters, picked by the low bit of `epoch`. After
//! swapping the table, a writer flips the epoch and drains the counter readers just left, then
//! does the same for the other one. Readers arriving after a flip count in the other slot, so
//! each drain only waits out lookups that were already in flight.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Association between a simulated instruction and the host address to resume at when a probe
/// issued on its behalf faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LandingPadEntry {
    pub simulated_pc: usize,
    pub landing_pad: usize,
}

impl LandingPadEntry {
    pub const fn new(simulated_pc: usize, landing_pad: usize) -> Self {
        LandingPadEntry { simulated_pc, landing_pad }
    }
}

/// Handle to a batch of entries registered with [`Registry::register_region`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionId(u64);

/// Published snapshot, sorted by `simulated_pc` with unique keys. Never mutated.
struct Table {
    entries: Box<[LandingPadEntry]>,
}

/// Who keeps an entry alive. The entry goes away when neither does.
#[derive(Clone, Copy, Default, Debug)]
struct Hold {
    /// Registered through [`Registry::register`]. Repeated registration does not stack.
    direct: bool,
    /// Number of live regions containing the key.
    regions: usize,
}

impl Hold {
    fn is_released(&self) -> bool {
        !self.direct && self.regions == 0
    }
}

/// State only touched with the writer lock held.
struct Writer {
    next_region: u64,
    holds: BTreeMap<usize, Hold>,
    /// Keys of each live region, sorted and deduplicated.
    regions: Vec<(RegionId, Vec<usize>)>,
}

pub struct Registry {
    table: AtomicPtr<Table>,
    epoch: AtomicUsize,
    readers: [AtomicUsize; 2],
    writer: Mutex<Writer>,
}

fn search(entries: &[LandingPadEntry], simulated_pc: usize) -> std::result::Result<usize, usize> {
    entries.binary_search_by_key(&simulated_pc, |entry| entry.simulated_pc)
}

/// Insert `entry` into the sorted `entries`. Returns whether it was newly inserted; an identical
/// entry already present is accepted, a different landing pad for the same key is not.
fn insert(entries: &mut Vec<LandingPadEntry>, entry: LandingPadEntry) -> Result<bool> {
    match search(entries, entry.simulated_pc) {
        Ok(index) => {
            let existing = entries[index].landing_pad;
            if existing == entry.landing_pad {
                return Ok(false);
            }
            warn!(
                target: "probe",
                "rejecting landing pad {:#x} for simulated pc {:#x}, already guarded by {:#x}",
                entry.landing_pad, entry.simulated_pc, existing
            );
            Err(Error::Conflict {
                simulated_pc: entry.simulated_pc,
                existing,
                requested: entry.landing_pad,
            })
        }
        Err(index) => {
            entries.insert(index, entry);
            Ok(true)
        }
    }
}

impl Registry {
    pub const fn new() -> Self {
        Registry {
            table: AtomicPtr::new(ptr::null_mut()),
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            writer: parking_lot::const_mutex(Writer {
                next_region: 0,
                holds: BTreeMap::new(),
                regions: Vec::new(),
            }),
        }
    }

    /// Find the landing pad guarding `simulated_pc`.
    ///
    /// This is the only operation permitted from the fault handler. It does not allocate, block
    /// or panic.
    #[inline]
    pub fn lookup(&self, simulated_pc: usize) -> Option<usize> {
        let readers = &self.readers[self.epoch.load(Ordering::SeqCst) & 1];
        readers.fetch_add(1, Ordering::SeqCst);
        let table = self.table.load(Ordering::SeqCst);
        let result = if table.is_null() {
            None
        } else {
            // The writer does not free `table` while we are counted.
            let entries = unsafe { &(*table).entries };
            search(entries, simulated_pc)
                .ok()
                .and_then(|index| entries.get(index))
                .map(|entry| entry.landing_pad)
        };
        readers.fetch_sub(1, Ordering::Release);
        result
    }

    /// Record that a faulting probe covering `simulated_pc` resumes at `landing_pad`.
    ///
    /// Registering the same pair again is a no-op. Registering a different landing pad for a
    /// key that is already present, directly or through a region, is rejected, as is a zero
    /// landing pad.
    pub fn register(&self, simulated_pc: usize, landing_pad: usize) -> Result<()> {
        if landing_pad == 0 {
            return Err(Error::NullLandingPad(simulated_pc));
        }

        let mut writer = self.writer.lock();
        let mut entries = self.snapshot(&writer).to_vec();
        let inserted = insert(&mut entries, LandingPadEntry::new(simulated_pc, landing_pad))?;
        writer.holds.entry(simulated_pc).or_default().direct = true;
        if inserted {
            self.publish(&mut writer, entries);
            debug!(target: "probe", "guard simulated pc {:#x} with landing pad {:#x}", simulated_pc, landing_pad);
        }
        Ok(())
    }

    /// Drop the registration made by [`register`](Self::register). The entry stays while a
    /// live region still contains it. Returns false if `simulated_pc` was not registered
    /// directly.
    pub fn unregister(&self, simulated_pc: usize) -> bool {
        let mut writer = self.writer.lock();
        let hold = match writer.holds.get_mut(&simulated_pc) {
            Some(hold) if hold.direct => hold,
            _ => return false,
        };
        hold.direct = false;
        if hold.is_released() {
            writer.holds.remove(&simulated_pc);
            let mut entries = self.snapshot(&writer).to_vec();
            if let Ok(index) = search(&entries, simulated_pc) {
                entries.remove(index);
            }
            self.publish(&mut writer, entries);
            debug!(target: "probe", "unguard simulated pc {:#x}", simulated_pc);
        }
        true
    }

    /// Register a batch of entries, typically all guarded accesses of one piece of generated
    /// code. Either every entry is registered or, on the first conflict, none is.
    ///
    /// Entries shared with other regions or direct registrations must agree on the landing pad,
    /// and stay until every holder has let go of them.
    pub fn register_region(&self, region: &[LandingPadEntry]) -> Result<RegionId> {
        if let Some(entry) = region.iter().find(|entry| entry.landing_pad == 0) {
            return Err(Error::NullLandingPad(entry.simulated_pc));
        }

        let mut writer = self.writer.lock();
        let mut entries = self.snapshot(&writer).to_vec();
        let mut inserted = 0;
        for &entry in region {
            if insert(&mut entries, entry)? {
                inserted += 1;
            }
        }

        let mut keys: Vec<_> = region.iter().map(|entry| entry.simulated_pc).collect();
        keys.sort_unstable();
        keys.dedup();
        for &key in &keys {
            writer.holds.entry(key).or_default().regions += 1;
        }

        let id = RegionId(writer.next_region);
        writer.next_region += 1;
        debug!(target: "probe", "register region {:?} with {} entries, {} new", id, keys.len(), inserted);
        writer.regions.push((id, keys));
        if inserted != 0 {
            self.publish(&mut writer, entries);
        }
        Ok(id)
    }

    /// Let go of a region's entries. Entries still held by another region or by a direct
    /// registration stay. Returns false for an unknown or already released region.
    pub fn release_region(&self, id: RegionId) -> bool {
        let mut writer = self.writer.lock();
        let position = match writer.regions.iter().position(|(region, _)| *region == id) {
            Some(position) => position,
            None => return false,
        };
        let (_, keys) = writer.regions.swap_remove(position);

        let mut released = Vec::new();
        for key in keys {
            if let Some(hold) = writer.holds.get_mut(&key) {
                hold.regions -= 1;
                if hold.is_released() {
                    writer.holds.remove(&key);
                    released.push(key);
                }
            }
        }

        debug!(target: "probe", "release region {:?}, {} entries removed", id, released.len());
        if !released.is_empty() {
            let mut entries = self.snapshot(&writer).to_vec();
            entries.retain(|entry| released.binary_search(&entry.simulated_pc).is_err());
            self.publish(&mut writer, entries);
        }
        true
    }

    /// Copy of all current entries, sorted by simulated pc.
    pub fn entries(&self) -> Vec<LandingPadEntry> {
        let writer = self.writer.lock();
        self.snapshot(&writer).to_vec()
    }

    pub fn len(&self) -> usize {
        let writer = self.writer.lock();
        self.snapshot(&writer).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The published entries. Holding the writer lock keeps them alive.
    fn snapshot<'a>(&'a self, _writer: &'a Writer) -> &'a [LandingPadEntry] {
        let table = self.table.load(Ordering::Acquire);
        if table.is_null() {
            &[]
        } else {
            unsafe { &(*table).entries }
        }
    }

    /// Swap in a new table and free the retired one once all readers have left it.
    fn publish(&self, _writer: &mut Writer, entries: Vec<LandingPadEntry>) {
        let new = if entries.is_empty() {
            ptr::null_mut()
        } else {
            Box::into_raw(Box::new(Table { entries: entries.into_boxed_slice() }))
        };

        let old = self.table.swap(new, Ordering::SeqCst);
        if old.is_null() {
            return;
        }

        // A reader that could have loaded `old` is counted in one of the slots since before our
        // swap. Drain both, flipping first so that newcomers count elsewhere.
        for _ in 0..2 {
            let slot = self.epoch.fetch_add(1, Ordering::SeqCst) & 1;
            while self.readers[slot].load(Ordering::SeqCst) != 0 {
                std::hint::spin_loop();
            }
        }
        drop(unsafe { Box::from_raw(old) });
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let table = *self.table.get_mut();
        if !table.is_null() {
            drop(unsafe { Box::from_raw(table) });
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.entries()).finish()
    }
}

static GLOBAL: Registry = Registry::new();

/// The process-wide registry consulted by the installed fault handler.
pub fn global() -> &'static Registry {
    &GLOBAL
}

pub fn register(simulated_pc: usize, landing_pad: usize) -> Result<()> {
    GLOBAL.register(simulated_pc, landing_pad)
}

pub fn unregister(simulated_pc: usize) -> bool {
    GLOBAL.unregister(simulated_pc)
}

pub fn register_region(region: &[LandingPadEntry]) -> Result<RegionId> {
    GLOBAL.register_region(region)
}

pub fn release_region(id: RegionId) -> bool {
    GLOBAL.release_region(id)
}
