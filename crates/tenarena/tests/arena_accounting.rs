//! End-to-end accounting scenarios.
//!
//! The client registry is process-global, so every test takes `serial()`
//! before touching it and unregisters everything it registered.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tenarena::{
    estimated_allocated, malloc, precise_allocated, register_client, register_total_counter,
    set_tcache_enabled, switch_from_client, switch_to_client, unregister_client,
    unregister_current_client, update_client_threshold, update_total_counters, ClientGuard, Error,
    MAX_CLIENTS,
};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn basic_usage() {
    let _serial = serial();
    let client = register_client(false).unwrap();
    let sz1 = precise_allocated(client);

    // 1) Track an allocation.
    switch_to_client(client);
    let p = malloc(4096);
    switch_from_client();
    let sz2 = precise_allocated(client);
    assert!(sz2 > sz1);

    // 2) Allocation outside switch-to/from is not accounted.
    let p2 = malloc(4096);
    assert_eq!(precise_allocated(client), sz2);

    // 3) Track the deallocation.
    switch_to_client(client);
    unsafe { tenarena::free(p) };
    switch_from_client();
    assert!(precise_allocated(client) < sz2);

    unsafe { tenarena::free(p2) };
    unregister_client(client).unwrap();
}

#[test]
fn all_alloc_methods_are_tracked() {
    let _serial = serial();
    let client = register_client(false).unwrap();

    switch_to_client(client);
    let sz1 = precise_allocated(client);

    let p1 = malloc(2048);
    let sz2 = precise_allocated(client);
    assert!(sz2 > sz1);

    let p2 = tenarena::calloc(10, 100);
    let sz3 = precise_allocated(client);
    assert!(sz3 > sz2);

    let p3 = unsafe { tenarena::realloc(p1, 3121) };
    let sz4 = precise_allocated(client);
    assert!(sz4 > sz3);

    let p4 = malloc(100);
    let sz5 = precise_allocated(client);
    assert!(sz5 > sz4);

    unsafe { tenarena::free(p3) };
    let sz6 = precise_allocated(client);
    assert!(sz6 < sz5);

    unsafe { tenarena::free(p2) };
    let sz7 = precise_allocated(client);
    assert!(sz7 < sz6);

    unsafe { tenarena::sized_free(p4, 100) };
    assert_eq!(precise_allocated(client), 0);
    switch_from_client();

    unregister_client(client).unwrap();
}

#[test]
fn allocation_shapes_round_trip_to_zero() {
    let _serial = serial();
    let client = register_client(false).unwrap();

    // malloc / free
    switch_to_client(client);
    let p = malloc(2048);
    unsafe { tenarena::free(p) };
    switch_from_client();
    assert_eq!(precise_allocated(client), 0);

    // calloc / free
    switch_to_client(client);
    let p = tenarena::calloc(16, 64);
    unsafe { tenarena::free(p) };
    switch_from_client();
    assert_eq!(precise_allocated(client), 0);

    // realloc up, then free
    switch_to_client(client);
    let p = malloc(100);
    let p = unsafe { tenarena::realloc(p, 100_000) };
    unsafe { tenarena::free(p) };
    switch_from_client();
    assert_eq!(precise_allocated(client), 0);

    // realloc from null, then sized free
    switch_to_client(client);
    let p = unsafe { tenarena::realloc(std::ptr::null_mut(), 4096) };
    unsafe { tenarena::sized_free(p, 4096) };
    switch_from_client();
    assert_eq!(precise_allocated(client), 0);

    // zero-size shapes normalize to a real allocation
    switch_to_client(client);
    let p = malloc(0);
    assert!(!p.is_null());
    assert!(unsafe { tenarena::usable_size(p) } >= 8);
    let p = unsafe { tenarena::realloc(p, 0) };
    assert!(!p.is_null());
    unsafe { tenarena::free(p) };
    switch_from_client();
    assert_eq!(precise_allocated(client), 0);

    unregister_client(client).unwrap();
}

#[test]
fn threads_account_independently() {
    let _serial = serial();
    let clients: Vec<_> = (0..4).map(|_| register_client(false).unwrap()).collect();

    let handles: Vec<_> = clients
        .iter()
        .map(|&client| {
            thread::spawn(move || {
                let sz1 = precise_allocated(client);
                switch_to_client(client);
                let p = malloc(4096);
                assert!(precise_allocated(client) > sz1);
                unsafe { tenarena::free(p) };
                assert_eq!(precise_allocated(client), sz1);
                switch_from_client();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    for client in clients {
        assert_eq!(precise_allocated(client), 0);
        unregister_client(client).unwrap();
    }
}

#[test]
fn total_counter_sinks_update_on_demand() {
    let _serial = serial();
    let clients: Vec<_> = (0..10).map(|_| register_client(false).unwrap()).collect();

    let sinks: Vec<_> = clients
        .iter()
        .map(|&client| {
            let sink = Arc::new(AtomicI64::new(0));
            register_total_counter(client, sink.clone()).unwrap();
            sink
        })
        .collect();

    let ptrs: Vec<_> = clients
        .iter()
        .map(|&client| {
            let _guard = ClientGuard::new(client);
            malloc(128)
        })
        .collect();

    // Nothing is pushed to the sinks until asked for.
    for sink in &sinks {
        assert_eq!(sink.load(Ordering::Relaxed), 0);
    }
    update_total_counters();
    for sink in &sinks {
        assert!(sink.load(Ordering::Relaxed) > 0);
    }

    for (&client, p) in clients.iter().zip(ptrs) {
        let _guard = ClientGuard::new(client);
        unsafe { tenarena::free(p) };
    }
    for client in clients {
        unregister_client(client).unwrap();
    }
}

#[test]
fn cross_client_free_saturates_at_zero() {
    let _serial = serial();
    let owner = register_client(false).unwrap();
    let other = register_client(false).unwrap();

    switch_to_client(owner);
    let p = malloc(4096);
    switch_from_client();
    assert!(precise_allocated(owner) > 0);

    // Credit lands on a client that never saw the charge: its internal
    // aggregate goes negative and must read back as 0, never wrap.
    switch_to_client(other);
    unsafe { tenarena::free(p) };
    switch_from_client();
    assert_eq!(precise_allocated(other), 0);
    assert_eq!(estimated_allocated(other), 0);

    unregister_client(owner).unwrap();
    unregister_client(other).unwrap();
}

#[test]
fn registration_exhausts_at_max_clients() {
    let _serial = serial();
    let mut clients = Vec::new();
    loop {
        match register_client(false) {
            Ok(client) => clients.push(client),
            Err(Error::ExhaustedClients) => break,
            Err(e) => panic!("unexpected register failure: {e}"),
        }
    }
    assert_eq!(clients.len(), MAX_CLIENTS);
    assert!(matches!(
        register_client(false),
        Err(Error::ExhaustedClients)
    ));
    for client in clients {
        unregister_client(client).unwrap();
    }
}

#[test]
fn recycled_slot_starts_from_zero() {
    let _serial = serial();
    let first = register_client(false).unwrap();

    switch_to_client(first);
    let p = malloc(4096);
    switch_from_client();
    assert!(precise_allocated(first) > 0);

    // Unregister with the charge still outstanding; the next tenant of the
    // slot must not inherit it.
    unregister_client(first).unwrap();
    let second = register_client(false).unwrap();
    assert_eq!(second.index(), first.index());
    assert_eq!(second.arena(), first.arena());
    assert_eq!(precise_allocated(second), 0);

    unsafe { tenarena::free(p) };
    unregister_client(second).unwrap();
}

#[test]
fn unregister_current_uses_thread_binding() {
    let _serial = serial();
    let client = register_client(false).unwrap();

    switch_to_client(client);
    unregister_current_client().unwrap();
    assert!(matches!(
        unregister_client(client),
        Err(Error::InvalidHandle(_))
    ));
    switch_from_client();

    assert!(matches!(
        unregister_current_client(),
        Err(Error::NoCurrentClient)
    ));
}

#[test]
fn estimate_tracks_within_drift_threshold() {
    let _serial = serial();
    let mut client = register_client(false).unwrap();
    client.set_estimate_update_threshold(64 * 1024, 1.0);
    update_client_threshold(client);

    // A charge far above the per-shard threshold folds immediately.
    switch_to_client(client);
    let p = malloc(1 << 20);
    assert!(estimated_allocated(client) >= 1 << 20);

    unsafe { tenarena::free(p) };
    assert_eq!(estimated_allocated(client), 0);
    switch_from_client();

    assert_eq!(precise_allocated(client), 0);
    unregister_client(client).unwrap();
}

#[test]
fn thread_cached_clients_round_trip() {
    let _serial = serial();
    let client = register_client(true).unwrap();
    assert!(client.thread_cache());

    thread::spawn(move || {
        switch_to_client(client);
        let p = malloc(512);
        unsafe { tenarena::free(p) };
        switch_from_client();
    })
    .join()
    .unwrap();

    assert_eq!(precise_allocated(client), 0);
    unregister_client(client).unwrap();
}

#[test]
fn tcache_enable_is_global_override() {
    let _serial = serial();
    set_tcache_enabled(false);
    let client = register_client(true).unwrap();
    assert!(!client.thread_cache());
    unregister_client(client).unwrap();

    set_tcache_enabled(true);
    let client = register_client(true).unwrap();
    assert!(client.thread_cache());
    unregister_client(client).unwrap();
}
