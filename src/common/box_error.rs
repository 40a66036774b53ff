//! boxed error type used so that `?` works across the thread boundaries.
//!
//! Everything that can fail in the relay returns this.  The Send + Sync
//! bounds are what let results move in and out of the signaling threads.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
