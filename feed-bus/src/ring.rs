//! Shared OHLC ring buffer (C1).
//!
//! A fixed-capacity, columnar ring of OHLCV bars per `(broker, symbol)`,
//! backed by an anonymous-or-named memory mapping so a second process on
//! the same host can attach read-only via [`ShmToken`]. Exactly one
//! handle is ever the writer for a given `name`; that discipline is
//! enforced one level up by the feed bus's writer election (see
//! `bus::allocate_persistent_feed`), not by this module.

use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{FeedBusError, Result};

/// One OHLCV bar. Base columns match the wire schema in the spec;
/// `bar_wap`/`count` are the optional broker-specific extension columns,
/// always present here so the row has a fixed, `repr(C)` layout -- a
/// broker that doesn't populate them just leaves them zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OhlcRow {
    pub index: i32,
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bar_wap: f64,
    pub count: i64,
}

impl OhlcRow {
    pub const fn zeroed() -> Self {
        Self {
            index: 0,
            time: 0,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
            bar_wap: 0.0,
            count: 0,
        }
    }
}

/// Column descriptor, carried in [`ShmToken::dtype_descr`] so an attaching
/// reader knows which logical columns this writer has populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDescr {
    pub name: String,
    pub active: bool,
}

pub fn base_dtype_descr() -> Vec<ColumnDescr> {
    [
        "index", "time", "open", "high", "low", "close", "volume",
    ]
    .iter()
    .map(|n| ColumnDescr {
        name: n.to_string(),
        active: true,
    })
    .collect()
}

/// Serialisable descriptor letting any process on the host attach
/// read-only to the same ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmToken {
    pub name: String,
    pub dtype_descr: Vec<ColumnDescr>,
    pub size: usize,
}

const HEADER_BYTES: usize = 16; // [written_count: u64][capacity: u64]
const ROW_BYTES: usize = std::mem::size_of::<OhlcRow>();

fn shm_path(base_dir: &std::path::Path, name: &str) -> PathBuf {
    base_dir.join(format!("{name}.ohlc-ring"))
}

/// Backing store for an OHLC ring, shared between the one writer handle
/// and any number of reader handles attached to the same `name`.
struct RingStore {
    mmap: parking_lot::RwLock<MmapMut>,
    capacity: usize,
    name: String,
}

impl RingStore {
    fn create(base_dir: &std::path::Path, name: &str, capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(|e| FeedBusError::Transport(e.to_string()))?;
        let path = shm_path(base_dir, name);
        let total = HEADER_BYTES + capacity * ROW_BYTES;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| FeedBusError::Transport(e.to_string()))?;
        file.set_len(total as u64)
            .map_err(|e| FeedBusError::Transport(e.to_string()))?;
        let mmap = unsafe {
            MmapOptions::new()
                .len(total)
                .map_mut(&file)
                .map_err(|e| FeedBusError::Transport(e.to_string()))?
        };
        let store = Self {
            mmap: parking_lot::RwLock::new(mmap),
            capacity,
            name: name.to_string(),
        };
        store.write_header(0, capacity);
        Ok(store)
    }

    fn attach(base_dir: &std::path::Path, token: &ShmToken) -> Result<Self> {
        let path = shm_path(base_dir, &token.name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| FeedBusError::Transport(e.to_string()))?;
        let mmap = unsafe {
            MmapOptions::new()
                .len(HEADER_BYTES + token.size * ROW_BYTES)
                .map_mut(&file)
                .map_err(|e| FeedBusError::Transport(e.to_string()))?
        };
        Ok(Self {
            mmap: parking_lot::RwLock::new(mmap),
            capacity: token.size,
            name: token.name.clone(),
        })
    }

    fn write_header(&self, written: u64, capacity: usize) {
        let mut guard = self.mmap.write();
        let bytes = guard.as_mut();
        bytes[0..8].copy_from_slice(&written.to_le_bytes());
        bytes[8..16].copy_from_slice(&(capacity as u64).to_le_bytes());
    }

    fn written_count(&self) -> u64 {
        let guard = self.mmap.read();
        u64::from_le_bytes(guard[0..8].try_into().unwrap())
    }

    fn set_written_count(&self, n: u64) {
        let mut guard = self.mmap.write();
        guard[0..8].copy_from_slice(&n.to_le_bytes());
    }

    /// Writes `row` at logical ring slot `slot` (already `% capacity`).
    /// SAFETY: caller guarantees exclusive write access (single writer
    /// discipline enforced by the feed bus, not by this type).
    fn write_row(&self, slot: usize, row: OhlcRow) {
        let offset = HEADER_BYTES + slot * ROW_BYTES;
        let mut guard = self.mmap.write();
        let dst = &mut guard[offset..offset + ROW_BYTES];
        let src =
            unsafe { std::slice::from_raw_parts(&row as *const OhlcRow as *const u8, ROW_BYTES) };
        dst.copy_from_slice(src);
    }

    fn read_row(&self, slot: usize) -> OhlcRow {
        let offset = HEADER_BYTES + slot * ROW_BYTES;
        let guard = self.mmap.read();
        let src = &guard[offset..offset + ROW_BYTES];
        let mut row = OhlcRow::zeroed();
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                &mut row as *mut OhlcRow as *mut u8,
                ROW_BYTES,
            );
        }
        row
    }
}

/// Read-only view of the currently-populated slice, oldest first.
#[derive(Debug, Clone)]
pub struct OhlcSnapshot {
    pub rows: Vec<OhlcRow>,
}

/// A shared OHLC ring. Construct via [`OhlcRing::create`]; readers attach
/// via [`OhlcRing::attach`] using the writer's [`ShmToken`].
pub struct OhlcRing {
    store: Arc<RingStore>,
    dtype_descr: Vec<ColumnDescr>,
    /// count of rows ever written, monotonically increasing; wraps
    /// modulo `capacity` for the physical slot.
    written: AtomicU64,
    writable: bool,
}

impl OhlcRing {
    /// Creates a brand-new ring backed by a file under `base_dir` named
    /// after `name`. This is the writer's entry point (`maybe_open_shm_array`
    /// in the distilled spec's vocabulary): `opened=true` on return means
    /// this caller must run backfill.
    pub fn create(base_dir: &std::path::Path, name: &str, capacity: usize) -> Result<Self> {
        let store = RingStore::create(base_dir, name, capacity)?;
        Ok(Self {
            store: Arc::new(store),
            dtype_descr: base_dtype_descr(),
            written: AtomicU64::new(0),
            writable: true,
        })
    }

    /// Attaches read-only to an existing ring via its token.
    pub fn attach(base_dir: &std::path::Path, token: &ShmToken) -> Result<Self> {
        let store = RingStore::attach(base_dir, token)?;
        let written = store.written_count();
        Ok(Self {
            store: Arc::new(store),
            dtype_descr: token.dtype_descr.clone(),
            written: AtomicU64::new(written),
            writable: false,
        })
    }

    pub fn token(&self) -> ShmToken {
        ShmToken {
            name: self.store.name.clone(),
            dtype_descr: self.dtype_descr.clone(),
            size: self.store.capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity
    }

    /// Appends `rows` at the head (or, if `prepend`, inserts them
    /// logically "behind" the live cursor for historical backfill).
    /// Writer-only: panics if this handle was attached read-only.
    pub fn push(&self, rows: &[OhlcRow], prepend: bool) -> Result<()> {
        if !self.writable {
            return Err(FeedBusError::Transport(format!(
                "attempted write on read-only ring {}",
                self.store.name
            )));
        }
        let cap = self.store.capacity;
        if rows.len() > cap {
            return Err(FeedBusError::RingOverflow {
                name: self.store.name.clone(),
                rows: rows.len(),
            });
        }
        if prepend {
            // Backfill: write behind the current head without advancing
            // the write cursor, oldest-first starting at the slot just
            // behind the first live row.
            let head = self.written.load(Ordering::Acquire);
            for (i, row) in rows.iter().rev().enumerate() {
                let slot = ((head as i64 - 1 - i as i64).rem_euclid(cap as i64)) as usize;
                self.store.write_row(slot, *row);
            }
            return Ok(());
        }
        for row in rows {
            let head = self.written.fetch_add(1, Ordering::AcqRel);
            let slot = (head % cap as u64) as usize;
            self.store.write_row(slot, *row);
        }
        self.store.set_written_count(self.written.load(Ordering::Acquire));
        Ok(())
    }

    /// Updates the current head row in place (used by the sampler to
    /// maintain running OHLCV aggregates without advancing the cursor).
    pub fn update_head(&self, row: OhlcRow) -> Result<()> {
        if !self.writable {
            return Err(FeedBusError::Transport(format!(
                "attempted write on read-only ring {}",
                self.store.name
            )));
        }
        let written = self.written.load(Ordering::Acquire);
        if written == 0 {
            return self.push(&[row], false);
        }
        let cap = self.store.capacity as u64;
        let slot = ((written - 1) % cap) as usize;
        self.store.write_row(slot, row);
        Ok(())
    }

    /// A read-only view of the populated slice, oldest first. Readers
    /// tolerate a torn head row per the spec; everything else is stable.
    pub fn array(&self) -> OhlcSnapshot {
        let written = self.store.written_count();
        let cap = self.store.capacity as u64;
        let len = written.min(cap) as usize;
        let start = if written > cap { written - cap } else { 0 };
        let mut rows = Vec::with_capacity(len);
        for i in 0..len {
            let slot = ((start + i as u64) % cap) as usize;
            rows.push(self.store.read_row(slot));
        }
        OhlcSnapshot { rows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(t: i64, close: f64) -> OhlcRow {
        OhlcRow {
            index: 0,
            time: t,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            bar_wap: 0.0,
            count: 1,
        }
    }

    #[test]
    fn push_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let ring = OhlcRing::create(dir.path(), "ib.aapl", 4).unwrap();
        ring.push(&[row(1, 1.0), row(2, 2.0)], false).unwrap();
        let snap = ring.array();
        assert_eq!(snap.rows.len(), 2);
        assert_eq!(snap.rows[0].time, 1);
        assert_eq!(snap.rows[1].close, 2.0);
    }

    #[test]
    fn wraps_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let ring = OhlcRing::create(dir.path(), "ib.aapl", 2).unwrap();
        ring.push(&[row(1, 1.0), row(2, 2.0), row(3, 3.0)], false)
            .unwrap();
        let snap = ring.array();
        assert_eq!(snap.rows.len(), 2);
        assert_eq!(snap.rows[0].time, 2);
        assert_eq!(snap.rows[1].time, 3);
    }

    #[test]
    fn update_head_does_not_advance_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let ring = OhlcRing::create(dir.path(), "ib.aapl", 4).unwrap();
        ring.push(&[row(1, 1.0)], false).unwrap();
        ring.update_head(row(1, 1.5)).unwrap();
        let snap = ring.array();
        assert_eq!(snap.rows.len(), 1);
        assert_eq!(snap.rows[0].close, 1.5);
    }

    #[test]
    fn reader_attaches_via_token() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OhlcRing::create(dir.path(), "ib.aapl", 8).unwrap();
        writer.push(&[row(1, 1.0), row(2, 2.0)], false).unwrap();
        let reader = OhlcRing::attach(dir.path(), &writer.token()).unwrap();
        let snap = reader.array();
        assert_eq!(snap.rows.len(), 2);
        assert!(reader.push(&[row(3, 3.0)], false).is_err());
    }
}
