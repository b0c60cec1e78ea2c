//! Process-wide table of client slots.
//!
//! A slot cycles Free(arena=0) -> Free(arena=A) <-> InUse(arena=A): the
//! backing arena is created on a slot's first registration and recycled on
//! every later one, since arenas are expensive to create and jemalloc never
//! really gives them back. All slot state is read and written under a single
//! writer lock; the allocation hot path touches none of it.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::binding;
use crate::client::{ClientHandle, MAX_CLIENTS};
use crate::error::Error;
use crate::jemalloc;
use crate::tracker;

struct Slot {
    used: bool,
    arena: u16,
    /// External counter receiving this client's total on `update_total_counters`.
    total: Option<Arc<AtomicI64>>,
}

impl Slot {
    const EMPTY: Slot = Slot {
        used: false,
        arena: 0,
        total: None,
    };
}

static CLIENTS: RwLock<[Slot; MAX_CLIENTS]> = RwLock::new([Slot::EMPTY; MAX_CLIENTS]);

pub(crate) fn register(thread_cache: bool) -> Result<ClientHandle, Error> {
    let mut clients = CLIENTS.write();
    for (index, slot) in clients.iter_mut().enumerate() {
        if slot.used {
            continue;
        }
        if slot.arena == 0 {
            slot.arena = jemalloc::create_arena()?;
        }
        slot.used = true;
        let handle = ClientHandle::new(
            index as u8,
            slot.arena,
            thread_cache && binding::tcache_enabled(),
        );
        // Zero the aggregate and every shard so a recycled index cannot
        // inherit a stale residual from its previous tenant.
        tracker::client_registered(&handle);
        debug!(
            index = handle.index(),
            arena = handle.arena(),
            thread_cache = handle.thread_cache(),
            "registered client"
        );
        return Ok(handle);
    }
    Err(Error::ExhaustedClients)
}

pub(crate) fn unregister(client: &ClientHandle) -> Result<(), Error> {
    let index = client.index as usize;
    if index >= MAX_CLIENTS {
        return Err(Error::InvalidHandle(client.index));
    }
    let mut clients = CLIENTS.write();
    let slot = &mut clients[index];
    if !slot.used {
        return Err(Error::InvalidHandle(client.index));
    }
    // Reset the slot but keep the arena for the next tenant.
    *slot = Slot {
        used: false,
        arena: slot.arena,
        total: None,
    };
    debug!(index = client.index, "unregistered client");
    Ok(())
}

/// Unregister whichever client the calling thread is switched to, located by
/// the arena encoded in the thread's allocation flags.
pub(crate) fn unregister_current() -> Result<(), Error> {
    let arena = jemalloc::arena_from_flags(binding::current_flags())
        .ok_or(Error::NoCurrentClient)?;
    let mut clients = CLIENTS.write();
    for (index, slot) in clients.iter_mut().enumerate() {
        if slot.arena == arena {
            *slot = Slot {
                used: false,
                arena,
                total: None,
            };
            debug!(index, arena, "unregistered current client");
            return Ok(());
        }
    }
    Err(Error::NoCurrentClient)
}

pub(crate) fn register_total_counter(
    client: &ClientHandle,
    counter: Arc<AtomicI64>,
) -> Result<(), Error> {
    let index = client.index as usize;
    if index >= MAX_CLIENTS {
        return Err(Error::InvalidHandle(client.index));
    }
    CLIENTS.write()[index].total = Some(counter);
    Ok(())
}

/// Snapshot every live client's allocator-reported total into its registered
/// sink. Periodic by caller convention; stats failures are fatal.
pub(crate) fn update_total_counters() {
    use std::sync::atomic::Ordering;

    let clients = CLIENTS.write();
    for slot in clients.iter() {
        if !slot.used || slot.arena == 0 {
            continue;
        }
        if let Some(total) = &slot.total {
            let allocated = jemalloc::allocated_for_arena(slot.arena)
                .expect("failed to read arena allocation stats");
            total.store(allocated as i64, Ordering::Relaxed);
        }
    }
}
