//! Per-client byte accounting.
//!
//! Two interchangeable backends satisfy the same contract; one is selected at
//! build time. Both keep a signed cache-padded aggregate per client plus a set
//! of signed shards, fold a shard into the aggregate whenever its absolute
//! value crosses the client's drift threshold, and clamp to zero at the public
//! read edge. The aggregate must stay signed: depending on which shard folds
//! first, a client that frees on one thread what it allocated on another can
//! legitimately sit below zero between folds.

cfg_if::cfg_if! {
    if #[cfg(feature = "core-local-tracker")] {
        mod core_local;
        pub(crate) use core_local::*;
    } else {
        mod thread_local;
        pub(crate) use thread_local::*;
    }
}
