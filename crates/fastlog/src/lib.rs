//! Circular in-memory logging for hot paths.
//!
//! A [`LogBuf`] is a fixed ring of 32-byte records owned by one thread,
//! which logs routine events to it for free (one copy, no locks, no
//! allocation). When something goes wrong, [`FastLogMgr::dump_all`]
//! snapshots every registered ring into a preallocated scratch buffer and
//! pretty-prints the records through per-type dumper functions, giving the
//! last few hundred events of every thread at the moment of the crash.
//!
//! The dump path never allocates; the scratch snapshot is sized at manager
//! creation. Records are opaque to this crate beyond the leading `u16`
//! type tag, which selects the dumper.

use std::cell::UnsafeCell;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Every record is exactly this size: a `u16` type tag plus 30 payload
/// bytes.
pub const ENTRY_SIZE: usize = 32;

/// Number of records in one ring.
pub const RING_ENTRIES: usize = 512;

/// Highest record type tag, exclusive.
pub const TYPE_MAX: usize = 64;

/// Maximum length of a buffer name; longer names are truncated.
pub const NAME_MAX: usize = 24;

/// One fast-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub ty: u16,
    pub data: [u8; ENTRY_SIZE - 2],
}

impl Entry {
    pub fn new(ty: u16) -> Entry {
        Entry {
            ty,
            data: [0; ENTRY_SIZE - 2],
        }
    }
}

/// Renders one record to the dump output. Must not allocate.
pub type DumperFn = fn(&Entry, &mut dyn Write) -> io::Result<()>;

struct Ring {
    entries: [Entry; RING_ENTRIES],
}

impl Ring {
    fn empty() -> Box<Ring> {
        Box::new(Ring {
            entries: [Entry::new(0); RING_ENTRIES],
        })
    }
}

/// A per-thread ring of records.
///
/// Exactly one thread may call [`log`](LogBuf::log); the manager's dump
/// path reads the ring concurrently with a plain memory copy. A record
/// being overwritten during a dump can come out garbled, which the dump
/// format tolerates — that is the price of keeping the log path free of
/// synchronization, and it matches how the ring behaves under a crash
/// handler.
pub struct LogBuf {
    name: String,
    ring: UnsafeCell<Box<Ring>>,
    off: AtomicU32,
}

// One writer thread plus a memcpy-style reader; see the struct docs.
unsafe impl Sync for LogBuf {}
unsafe impl Send for LogBuf {}

impl LogBuf {
    fn new(name: &str) -> Arc<LogBuf> {
        let mut name = name.to_string();
        name.truncate(NAME_MAX);
        Arc::new(LogBuf {
            name,
            ring: UnsafeCell::new(Ring::empty()),
            off: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a record, overwriting the oldest once the ring is full.
    pub fn log(&self, entry: Entry) {
        let off = self.off.load(Ordering::Relaxed) as usize % RING_ENTRIES;
        // Sole writer: only the owning thread stores through the cell.
        unsafe {
            (*self.ring.get()).entries[off] = entry;
        }
        self.off
            .store(((off + 1) % RING_ENTRIES) as u32, Ordering::Release);
    }

    fn snapshot_into(&self, snap: &mut Snapshot) {
        snap.name.clear();
        snap.name.push_str(&self.name);
        snap.off = self.off.load(Ordering::Acquire) as usize % RING_ENTRIES;
        // Racy copy of a ring the owner may still be writing; bounded and
        // intentional, per the LogBuf contract.
        unsafe {
            snap.ring.entries = (*self.ring.get()).entries;
        }
    }
}

struct Snapshot {
    name: String,
    off: usize,
    ring: Box<Ring>,
}

/// Registry of every live ring plus the dumper table and the scratch
/// snapshot used by `dump_all`.
pub struct FastLogMgr {
    bufs: Mutex<Vec<Weak<LogBuf>>>,
    dumpers: Mutex<[Option<DumperFn>; TYPE_MAX]>,
    scratch: Mutex<Snapshot>,
}

impl FastLogMgr {
    pub fn new() -> Arc<FastLogMgr> {
        Arc::new(FastLogMgr {
            bufs: Mutex::new(Vec::new()),
            dumpers: Mutex::new([None; TYPE_MAX]),
            scratch: Mutex::new(Snapshot {
                name: String::with_capacity(NAME_MAX),
                off: 0,
                ring: Ring::empty(),
            }),
        })
    }

    /// Create and register a ring. The caller's thread becomes its writer.
    pub fn create_buf(&self, name: &str) -> Arc<LogBuf> {
        let buf = LogBuf::new(name);
        let mut bufs = self.bufs.lock().unwrap();
        bufs.retain(|w| w.strong_count() > 0);
        bufs.push(Arc::downgrade(&buf));
        buf
    }

    /// Install the dumper for one record type. Later registrations win.
    pub fn register_dumper(&self, ty: u16, f: DumperFn) {
        if (ty as usize) < TYPE_MAX {
            self.dumpers.lock().unwrap()[ty as usize] = Some(f);
        }
    }

    /// Snapshot and pretty-print every registered ring, oldest record
    /// first. Rings whose owner has exited are skipped.
    pub fn dump_all(&self, w: &mut dyn Write) -> io::Result<()> {
        let bufs: Vec<Arc<LogBuf>> = self
            .bufs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect();
        let dumpers = *self.dumpers.lock().unwrap();
        let mut scratch = self.scratch.lock().unwrap();
        for buf in bufs {
            buf.snapshot_into(&mut scratch);
            w.write_all(b"*** FASTLOG ")?;
            w.write_all(scratch.name.as_bytes())?;
            w.write_all(b"\n")?;
            for i in 0..RING_ENTRIES {
                let entry = &scratch.ring.entries[(scratch.off + i) % RING_ENTRIES];
                if entry.ty == 0 {
                    continue;
                }
                match dumpers.get(entry.ty as usize).copied().flatten() {
                    Some(dump) => dump(entry, w)?,
                    None => {
                        w.write_all(b"(unknown record type)\n")?;
                    }
                }
            }
        }
        Ok(())
    }
}
