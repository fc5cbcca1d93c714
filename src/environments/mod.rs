//! Environment store.
//!
//! Environments partition the fleet: every node, query and carve belongs to
//! exactly one. Node requests carry the environment UUID in their URL path.

pub mod types;
pub mod store;

#[cfg(test)]
mod tests;
