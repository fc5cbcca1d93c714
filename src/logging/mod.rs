//! Node log forwarding.
//!
//! Status and result logs from the Log endpoint, and result payloads from
//! QueryWrite, are handed to one `LogSink` chosen at startup.

pub mod sink;
