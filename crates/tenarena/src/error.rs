//! Registry and backend error taxonomy.
//!
//! The allocation hot path never surfaces errors: allocation failure is a
//! null pointer, accounting failure does not exist (the trackers charge what
//! they can). Everything here comes from control-plane operations.

/// Errors surfaced by client registration and teardown.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// All client slots are in use; the only error a caller is expected to
    /// handle routinely.
    #[error("all {} client slots are in use", crate::MAX_CLIENTS)]
    ExhaustedClients,

    /// The handle does not refer to a slot currently in use.
    #[error("client slot {0} is not in use")]
    InvalidHandle(u8),

    /// The calling thread has no client switched in.
    #[error("calling thread has no current client")]
    NoCurrentClient,

    /// A jemalloc control operation failed. Not meaningfully recoverable;
    /// callers other than `register_client` treat this as fatal.
    #[error("jemalloc control operation `{op}` failed with code {code}")]
    Backend { op: &'static str, code: i32 },
}
