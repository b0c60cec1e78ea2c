//! Scoped client switching.

use std::marker::PhantomData;

use crate::client::ClientHandle;

/// Switches the calling thread to a client for the guard's lifetime, with the
/// switch-back guaranteed on every exit path.
///
/// Switching is not stacked: dropping a nested guard leaves the thread
/// unswitched, not restored to the outer client.
///
/// ```
/// let client = tenarena::register_client(false)?;
/// {
///     let _guard = tenarena::ClientGuard::new(client);
///     let p = tenarena::malloc(64);
///     unsafe { tenarena::free(p) };
/// }
/// assert_eq!(tenarena::precise_allocated(client), 0);
/// tenarena::unregister_client(client)?;
/// # Ok::<(), tenarena::Error>(())
/// ```
pub struct ClientGuard {
    // The switch lives in TLS; the guard must stay on its thread.
    _not_send: PhantomData<*mut ()>,
}

impl ClientGuard {
    pub fn new(client: ClientHandle) -> Self {
        crate::switch_to_client(client);
        ClientGuard {
            _not_send: PhantomData,
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        crate::switch_from_client();
    }
}
