//! Per-thread client binding.
//!
//! Two pieces of thread-local state drive the allocation hot path: the
//! currently selected client index and a precomputed jemalloc flags word
//! combining the client's arena with this thread's tcache for that client.
//! Both are computed once at switch time so that `malloc`/`free` read a
//! single TLS slot and nothing else.

use std::cell::{Cell, RefCell};
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::client::{ClientHandle, MAX_CLIENTS, NO_CLIENT_INDEX};
use crate::jemalloc;

static TCACHE_ENABLED: AtomicBool = AtomicBool::new(true);

pub(crate) fn set_tcache_enabled(enabled: bool) {
    TCACHE_ENABLED.store(enabled, Ordering::Relaxed);
}

pub(crate) fn tcache_enabled() -> bool {
    TCACHE_ENABLED.load(Ordering::Relaxed)
}

#[derive(Clone, Copy)]
struct CurrentClient {
    index: u8,
    flags: c_int,
}

/// Explicit tcache ids this thread has created, one per client slot; 0 means
/// none yet. Destroyed with the thread; leaking them would leak allocator-
/// side descriptors.
struct TCacheArray([u16; MAX_CLIENTS]);

impl Drop for TCacheArray {
    fn drop(&mut self) {
        for id in self.0 {
            if id != 0 {
                jemalloc::destroy_tcache(id).expect("failed to destroy thread cache");
            }
        }
    }
}

thread_local! {
    static CURRENT: Cell<CurrentClient> = const {
        Cell::new(CurrentClient { index: NO_CLIENT_INDEX, flags: 0 })
    };
    static TCACHES: RefCell<TCacheArray> = const { RefCell::new(TCacheArray([0; MAX_CLIENTS])) };
}

/// The calling thread's active client index and allocation flags.
#[inline]
pub(crate) fn current() -> (u8, c_int) {
    let cur = CURRENT.get();
    (cur.index, cur.flags)
}

#[inline]
pub(crate) fn current_flags() -> c_int {
    CURRENT.get().flags
}

/// Bind the calling thread to `client`; overwrites any previous binding.
pub(crate) fn switch_to(client: &ClientHandle) {
    let use_tcache = client.thread_cache && tcache_enabled();
    let flags = if client.arena == 0 {
        if use_tcache {
            0
        } else {
            jemalloc::MALLOCX_TCACHE_NONE
        }
    } else {
        let tcache_flags = if use_tcache {
            jemalloc::tcache_flags(tcache_for(client.index))
        } else {
            jemalloc::MALLOCX_TCACHE_NONE
        };
        jemalloc::arena_flags(client.arena) | tcache_flags
    };
    CURRENT.set(CurrentClient {
        index: client.index,
        flags,
    });
}

/// Unbind: subsequent allocations go to the default arena, unattributed.
pub(crate) fn switch_from() {
    switch_to(&ClientHandle::unbound(tcache_enabled()));
}

/// This thread's tcache for the given client, created on first use.
fn tcache_for(index: u8) -> u16 {
    debug_assert!((index as usize) < MAX_CLIENTS);
    TCACHES.with(|tcaches| {
        let mut tcaches = tcaches.borrow_mut();
        let slot = &mut tcaches.0[index as usize];
        if *slot == 0 {
            let id = jemalloc::create_tcache().expect("failed to create thread cache");
            debug!(index, tcache = id, "created thread cache");
            *slot = id;
        }
        *slot
    })
}
