//! Thread-local sharded accounting.
//!
//! Every thread owns a cell array with one signed counter per client slot.
//! The hot path touches only the calling thread's own cells, so charges and
//! credits never contend; draining walks all registered arrays. A thread's
//! cells are materialized by [`thread_up`] at switch time (never from inside
//! the allocation path) and folded into the retired totals when the thread
//! exits.

use std::cell::RefCell;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::client::{ClientHandle, DEFAULT_DRIFT_BYTES, MAX_CLIENTS};
use crate::jemalloc;

/// Per-client aggregate; negative excursions between folds are expected.
static ESTIMATED: [CachePadded<AtomicI64>; MAX_CLIENTS] =
    [const { CachePadded::new(AtomicI64::new(0)) }; MAX_CLIENTS];

/// Per-client drift threshold, published by `update_client_threshold`.
static THRESHOLDS: [AtomicU32; MAX_CLIENTS] =
    [const { AtomicU32::new(DEFAULT_DRIFT_BYTES) }; MAX_CLIENTS];

/// Contributions of threads that have already exited.
static RETIRED: [CachePadded<AtomicI64>; MAX_CLIENTS] =
    [const { CachePadded::new(AtomicI64::new(0)) }; MAX_CLIENTS];

struct Cells {
    values: [AtomicI64; MAX_CLIENTS],
}

static REGISTRY: Mutex<Vec<Arc<Cells>>> = Mutex::new(Vec::new());

/// Keeps this thread's cells registered; on drop, folds whatever is left in
/// them into the retired totals and deregisters.
struct ThreadCells(Arc<Cells>);

impl Drop for ThreadCells {
    fn drop(&mut self) {
        REGISTRY.lock().retain(|cells| !Arc::ptr_eq(cells, &self.0));
        for (index, cell) in self.0.values.iter().enumerate() {
            let value = cell.swap(0, Ordering::Relaxed);
            if value != 0 {
                RETIRED[index].fetch_add(value, Ordering::Relaxed);
            }
        }
    }
}

thread_local! {
    static CELLS: RefCell<Option<ThreadCells>> = const { RefCell::new(None) };
}

fn with_cells<R>(f: impl FnOnce(&Cells) -> R) -> R {
    CELLS.with(|cells| {
        let mut cells = cells.borrow_mut();
        let cells = cells.get_or_insert_with(|| {
            let arc = Arc::new(Cells {
                values: [const { AtomicI64::new(0) }; MAX_CLIENTS],
            });
            REGISTRY.lock().push(arc.clone());
            ThreadCells(arc)
        });
        f(&cells.0)
    })
}

/// Drain every registered thread's cell for `index`, plus the retired total.
fn read_full_and_reset(index: usize) -> i64 {
    let registry = REGISTRY.lock();
    let mut sum = RETIRED[index].swap(0, Ordering::Relaxed);
    for cells in registry.iter() {
        sum += cells.values[index].swap(0, Ordering::Relaxed);
    }
    sum
}

pub(crate) fn shard_count() -> usize {
    static COUNT: OnceLock<usize> = OnceLock::new();
    *COUNT.get_or_init(|| {
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    })
}

pub(crate) fn client_registered(client: &ClientHandle) {
    let index = client.index as usize;
    if index >= MAX_CLIENTS {
        return;
    }
    ESTIMATED[index].store(0, Ordering::Relaxed);
    THRESHOLDS[index].store(client.drift_threshold, Ordering::Relaxed);
    read_full_and_reset(index);
    // Materialize this thread's cells here, outside the allocation path.
    with_cells(|_| {});
}

/// Warm up the calling thread's cells before its first attributed allocation.
pub(crate) fn thread_up(index: u8) {
    if (index as usize) < MAX_CLIENTS {
        with_cells(|_| {});
    }
}

pub(crate) fn mem_allocated(index: u8, size: usize) {
    let index = index as usize;
    if index >= MAX_CLIENTS {
        return;
    }
    let charged = jemalloc::nallocx(size, 0) as i64;
    with_cells(|cells| {
        let cell = &cells.values[index];
        let value = cell.fetch_add(charged, Ordering::Relaxed) + charged;
        maybe_fold(index, cell, value);
    });
}

pub(crate) fn mem_deallocated(index: u8, ptr: *mut c_void) {
    let index = index as usize;
    if index >= MAX_CLIENTS {
        return;
    }
    let credited = unsafe { jemalloc::sallocx(ptr, 0) } as i64;
    with_cells(|cells| {
        let cell = &cells.values[index];
        let value = cell.fetch_sub(credited, Ordering::Relaxed) - credited;
        maybe_fold(index, cell, value);
    });
}

#[inline]
fn maybe_fold(index: usize, cell: &AtomicI64, value: i64) {
    if value.unsigned_abs() > THRESHOLDS[index].load(Ordering::Relaxed) as u64 {
        ESTIMATED[index].fetch_add(cell.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }
}

pub(crate) fn precise_allocated(client: &ClientHandle) -> usize {
    let index = client.index as usize;
    if index >= MAX_CLIENTS {
        return 0;
    }
    ESTIMATED[index].fetch_add(read_full_and_reset(index), Ordering::Relaxed);
    // Can still be negative here, e.g. one thread allocated after its cell was
    // read while another's free had already been drained; clamp on the way out.
    ESTIMATED[index].load(Ordering::Relaxed).max(0) as usize
}

pub(crate) fn estimated_allocated(client: &ClientHandle) -> usize {
    let index = client.index as usize;
    if index >= MAX_CLIENTS {
        return 0;
    }
    ESTIMATED[index].load(Ordering::Relaxed).max(0) as usize
}

pub(crate) fn update_client_threshold(client: &ClientHandle) {
    let index = client.index as usize;
    if index < MAX_CLIENTS {
        THRESHOLDS[index].store(client.drift_threshold, Ordering::Relaxed);
    }
}
