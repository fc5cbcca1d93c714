//! Node Directory
//!
//! Lookup of enrolled agents by node key, UUID or hostname, activity filtering
//! for target resolution, and the bulk last-seen refresh the batch writer issues.
//!
//! ## Submodules
//! - **`types`**: `Node`, `NodeId` and enrollment input.
//! - **`directory`**: the `NodeDirectory` contract and its `DashMap`-backed implementation.

pub mod types;
pub mod directory;

#[cfg(test)]
mod tests;
