//! Multi-tenant jemalloc arena facade with per-client byte accounting.
//!
//! A process hosts up to [`MAX_CLIENTS`] independent clients (think: logical
//! buckets or engine instances) sharing one address space. Each registered
//! client gets its own jemalloc arena, so fragmentation and thread-cache
//! behavior stay inside tenant boundaries, plus a byte counter fed by every
//! allocation made on its behalf.
//!
//! Attribution is by thread: [`switch_to_client`] binds the calling thread to
//! a client, and until [`switch_from_client`] every call through the
//! allocation facade ([`malloc`], [`calloc`], [`realloc`], [`free`], ...) is
//! routed to the client's arena and charged to its counter. Allocations made
//! while no client is switched in go to the default arena, unaccounted.
//!
//! Counters come in two flavors: [`estimated_allocated`] is a racy read of
//! the client's aggregate with bounded drift, [`precise_allocated`] drains
//! every accounting shard first. The accounting backend is picked at build
//! time: the `thread-local-tracker` feature (default) shards per thread, the
//! `core-local-tracker` feature shards per CPU core.
//!
//! ```
//! let client = tenarena::register_client(false)?;
//!
//! tenarena::switch_to_client(client);
//! let p = tenarena::malloc(4096);
//! tenarena::switch_from_client();
//! assert!(tenarena::precise_allocated(client) >= 4096);
//!
//! tenarena::switch_to_client(client);
//! unsafe { tenarena::free(p) };
//! tenarena::switch_from_client();
//! assert_eq!(tenarena::precise_allocated(client), 0);
//!
//! tenarena::unregister_client(client)?;
//! # Ok::<(), tenarena::Error>(())
//! ```

mod binding;
mod client;
mod error;
mod guard;
mod jemalloc;
mod registry;
mod tracker;

use std::ffi::c_void;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

pub use client::{ClientHandle, DEFAULT_DRIFT_BYTES, MAX_CLIENTS, NO_CLIENT_INDEX};
pub use error::Error;
pub use guard::ClientGuard;

/// Register a client, creating (or recycling) an arena for it.
///
/// `thread_cache` asks for explicit per-thread caches on top of the arena; it
/// is honored only while the global setting ([`set_tcache_enabled`]) allows
/// caching. Fails with [`Error::ExhaustedClients`] once all slots are in use.
pub fn register_client(thread_cache: bool) -> Result<ClientHandle, Error> {
    registry::register(thread_cache)
}

/// Release a client's slot. The arena is kept and recycled by a future
/// [`register_client`]; the handle must not be used afterwards.
pub fn unregister_client(client: ClientHandle) -> Result<(), Error> {
    registry::unregister(&client)
}

/// Release whichever client the calling thread is currently switched to.
pub fn unregister_current_client() -> Result<(), Error> {
    registry::unregister_current()
}

/// Bind the calling thread to `client`: subsequent facade allocations on this
/// thread go to the client's arena and are charged to its counter.
///
/// Overwrites any previous binding; switching does not nest. Use
/// [`ClientGuard`] for scoped switching.
pub fn switch_to_client(client: ClientHandle) {
    binding::switch_to(&client);
    tracker::thread_up(client.index);
}

/// Unbind the calling thread; allocations revert to the default arena and are
/// no longer attributed.
pub fn switch_from_client() {
    binding::switch_from();
}

/// The client's allocated bytes after draining every accounting shard.
pub fn precise_allocated(client: ClientHandle) -> usize {
    tracker::precise_allocated(&client)
}

/// The client's allocated bytes without draining; lags [`precise_allocated`]
/// by at most shard-count times the client's drift threshold.
pub fn estimated_allocated(client: ClientHandle) -> usize {
    tracker::estimated_allocated(&client)
}

/// Publish the handle's drift threshold (see
/// [`ClientHandle::set_estimate_update_threshold`]) to the accounting
/// backend. Visible to subsequent allocations; in-flight ones may still use
/// the old value.
pub fn update_client_threshold(client: ClientHandle) {
    tracker::update_client_threshold(&client)
}

/// Register an external counter to receive the client's allocator-reported
/// total on every [`update_total_counters`] call.
pub fn register_total_counter(client: ClientHandle, counter: Arc<AtomicI64>) -> Result<(), Error> {
    registry::register_total_counter(&client, counter)
}

/// Snapshot every live client's total (per jemalloc's own arena stats) into
/// its registered counter.
pub fn update_total_counters() {
    registry::update_total_counters()
}

/// Globally enable or disable thread caching. Consulted when clients register
/// and when threads switch; existing bindings keep their flags until the next
/// switch.
pub fn set_tcache_enabled(enabled: bool) {
    binding::set_tcache_enabled(enabled)
}

/// Allocate `size` bytes from the current client's arena and charge them to
/// its counter. Returns null on allocation failure.
#[inline]
pub fn malloc(size: usize) -> *mut c_void {
    // A 0-size realloc must not degenerate into a free through rallocx's
    // non-standard zero handling; malloc and realloc both normalize to a
    // deliberate 8-byte waste.
    let size = if size == 0 { 8 } else { size };
    let (index, flags) = binding::current();
    tracker::mem_allocated(index, size);
    unsafe { jemalloc::mallocx(size, flags) }
}

/// Allocate zeroed memory for `nmemb` elements of `size` bytes. Returns null
/// on overflow or allocation failure.
#[inline]
pub fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    let (index, flags) = binding::current();
    tracker::mem_allocated(index, total);
    unsafe { jemalloc::mallocx(total, flags | jemalloc::MALLOCX_ZERO) }
}

/// Resize the allocation at `ptr` to `size` bytes, crediting the old size and
/// charging the new one to the current client.
///
/// # Safety
///
/// `ptr` must be null or a live pointer previously returned by this facade.
#[inline]
pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let size = if size == 0 { 8 } else { size };
    let (index, flags) = binding::current();
    if ptr.is_null() {
        tracker::mem_allocated(index, size);
        return unsafe { jemalloc::mallocx(size, flags) };
    }
    tracker::mem_deallocated(index, ptr);
    tracker::mem_allocated(index, size);
    unsafe { jemalloc::rallocx(ptr, size, flags) }
}

/// Free `ptr`, crediting its size to the current client. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer previously returned by this facade.
#[inline]
pub unsafe fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let (index, flags) = binding::current();
    tracker::mem_deallocated(index, ptr);
    unsafe { jemalloc::dallocx(ptr, flags) }
}

/// Free `ptr` with its known allocation size, letting jemalloc skip the size
/// lookup. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer previously returned by this facade,
/// and `size` must be the size it was allocated with.
#[inline]
pub unsafe fn sized_free(ptr: *mut c_void, size: usize) {
    if ptr.is_null() {
        return;
    }
    let (index, flags) = binding::current();
    tracker::mem_deallocated(index, ptr);
    unsafe { jemalloc::sdallocx(ptr, size, flags) }
}

/// Real usable size of the allocation at `ptr`; 0 for null.
///
/// # Safety
///
/// `ptr` must be null or a live pointer previously returned by this facade.
#[inline]
pub unsafe fn usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    unsafe { jemalloc::sallocx(ptr, binding::current_flags()) }
}
