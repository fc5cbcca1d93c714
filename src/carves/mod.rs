//! Carve Manager
//!
//! A carve extracts files from a node as an ordered series of base64 blocks.
//!
//! ## Session state machine
//! `Scheduled` (a `carve=1` row arrived in a query write) → `InProgress`
//! (first block accepted) → `Completed` (every block accepted). `Failed` is
//! terminal and set by the reaper when a transfer stalls past its TTL.
//! `archived` is an orthogonal flag set once the artifact is reconstructed.
//!
//! ## Trust boundary
//! Nodes are authenticated upstream by their node key. CarveInit is only
//! honoured for the node owning the scheduled carve, and afterwards the
//! session id paired with the request id is the sole credential of the block
//! stream. Blocks carry no signature of their own.
//!
//! ## Submodules
//! - **`types`**: carve records, node payloads and results.
//! - **`blocks`**: per-carver block storage (`db`, `local`, `s3`).
//! - **`s3`**: the `ObjectStore` seam and its SigV4 REST client.
//! - **`archive`**: reconstruction by concatenation or multipart copy.
//! - **`manager`**: the `CarveManager` operations.
//! - **`reaper`**: periodic TTL sweep for stalled sessions.

pub mod types;
pub mod blocks;
pub mod s3;
pub mod archive;
pub mod manager;
pub mod reaper;

#[cfg(test)]
mod tests;
