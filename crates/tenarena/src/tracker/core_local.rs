//! Core-local sharded accounting.
//!
//! One signed cache-padded shard per (client, core). Threads map to a shard by
//! the CPU they are running on; two threads sharing a shard is fine since the
//! shards are atomic. [`thread_up`] has nothing to prepare here: the shard
//! matrix is materialized once, off the hot path, at first registration.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::OnceLock;
use std::thread;

use crossbeam_utils::CachePadded;

use crate::client::{ClientHandle, DEFAULT_DRIFT_BYTES, MAX_CLIENTS};
use crate::jemalloc;

/// Per-client aggregate; negative excursions between folds are expected.
static ESTIMATED: [CachePadded<AtomicI64>; MAX_CLIENTS] =
    [const { CachePadded::new(AtomicI64::new(0)) }; MAX_CLIENTS];

/// Per-client drift threshold, published by `update_client_threshold`.
static THRESHOLDS: [AtomicU32; MAX_CLIENTS] =
    [const { AtomicU32::new(DEFAULT_DRIFT_BYTES) }; MAX_CLIENTS];

/// Flat `MAX_CLIENTS x shard_count()` matrix of per-core counters.
fn shards() -> &'static [CachePadded<AtomicI64>] {
    static SHARDS: OnceLock<Box<[CachePadded<AtomicI64>]>> = OnceLock::new();
    SHARDS.get_or_init(|| {
        (0..MAX_CLIENTS * shard_count())
            .map(|_| CachePadded::new(AtomicI64::new(0)))
            .collect()
    })
}

pub(crate) fn shard_count() -> usize {
    static COUNT: OnceLock<usize> = OnceLock::new();
    *COUNT.get_or_init(|| {
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
            .next_power_of_two()
    })
}

#[inline]
fn shard_for(index: usize) -> &'static AtomicI64 {
    &shards()[index * shard_count() + current_core()]
}

/// Which shard the calling thread charges. On Linux this is the CPU the
/// thread is running on; elsewhere each thread gets a stable slot assigned
/// round-robin on first use.
#[cfg(target_os = "linux")]
#[inline]
fn current_core() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize & (shard_count() - 1)
    }
}

#[cfg(not(target_os = "linux"))]
#[inline]
fn current_core() -> usize {
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;

    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static SLOT: Cell<usize> = const { Cell::new(usize::MAX) };
    }
    SLOT.with(|slot| {
        let mut core = slot.get();
        if core == usize::MAX {
            core = NEXT.fetch_add(1, Ordering::Relaxed) & (shard_count() - 1);
            slot.set(core);
        }
        core
    })
}

pub(crate) fn client_registered(client: &ClientHandle) {
    let index = client.index as usize;
    if index >= MAX_CLIENTS {
        return;
    }
    ESTIMATED[index].store(0, Ordering::Relaxed);
    THRESHOLDS[index].store(client.drift_threshold, Ordering::Relaxed);
    for core in 0..shard_count() {
        shards()[index * shard_count() + core].swap(0, Ordering::Relaxed);
    }
}

pub(crate) fn thread_up(_index: u8) {}

pub(crate) fn mem_allocated(index: u8, size: usize) {
    let index = index as usize;
    if index >= MAX_CLIENTS {
        return;
    }
    let charged = jemalloc::nallocx(size, 0) as i64;
    let shard = shard_for(index);
    let value = shard.fetch_add(charged, Ordering::Relaxed) + charged;
    maybe_fold(index, shard, value);
}

pub(crate) fn mem_deallocated(index: u8, ptr: *mut c_void) {
    let index = index as usize;
    if index >= MAX_CLIENTS {
        return;
    }
    let credited = unsafe { jemalloc::sallocx(ptr, 0) } as i64;
    let shard = shard_for(index);
    let value = shard.fetch_sub(credited, Ordering::Relaxed) - credited;
    maybe_fold(index, shard, value);
}

#[inline]
fn maybe_fold(index: usize, shard: &AtomicI64, value: i64) {
    if value.unsigned_abs() > THRESHOLDS[index].load(Ordering::Relaxed) as u64 {
        ESTIMATED[index].fetch_add(shard.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }
}

pub(crate) fn precise_allocated(client: &ClientHandle) -> usize {
    let index = client.index as usize;
    if index >= MAX_CLIENTS {
        return 0;
    }
    for core in 0..shard_count() {
        let shard = &shards()[index * shard_count() + core];
        ESTIMATED[index].fetch_add(shard.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }
    // Can still be negative here, e.g. core 0 allocated after its shard was
    // read while core n's free had already been drained; clamp on the way out.
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
