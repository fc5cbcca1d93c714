//! Node Protocol Module
//!
//! The thin HTTP adapter osquery agents talk to. Every route carries the
//! environment UUID in its path (`/:env/...`).
//!
//! ## Endpoints
//! - **enroll**: secret check, node creation or re-keying.
//! - **config**: raw environment configuration.
//! - **log**: status/result logs, optionally gzip-encoded, forwarded to the log sink.
//! - **read / write**: the distributed query poll and its results. Result rows
//!   flagged `carve=1` schedule carves.
//! - **init / block**: the carve transfer.
//!
//! Authenticated requests queue a liveness event on the batch writer;
//! CarveInit refreshes its node immediately instead.
//! Unknown node keys are answered with `node_invalid` / `success=false`
//! rather than an HTTP error so agents simply retry.

pub mod handlers;
pub mod protocol;
