//! Batch Writer
//!
//! Every node request produces a "refresh last-seen/IP" signal. Writing each
//! one individually would turn polling load into write load, so handlers push
//! a `WriteEvent` into a bounded channel and a single consumer task coalesces
//! them per node and flushes one bulk update to the Node Directory.
//!
//! ## Flush policy
//! - **Size**: the pending map reaches `batch_size` distinct nodes.
//! - **Time**: `timeout` elapsed since the previous flush.
//!
//! The timer is re-armed after every flush, whichever trigger caused it.

pub mod types;
pub mod writer;
