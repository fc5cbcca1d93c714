//! Distributed Query Manager
//!
//! Owns distributed-query records and their per-node assignments.
//!
//! ## Lifecycle
//! 1. **Dispatch**: a query header is created, its target filters are resolved
//!    against the Node Directory and one `NodeQuery` is created per target.
//!    `expected` records how many targets were resolved.
//! 2. **Poll**: every node asks for its pending queries on each read cycle.
//! 3. **Results**: a node's write marks its assignment executed and bumps the
//!    query's `executions` or `errors` counter.
//! 4. **Administration**: complete, expire, activate and delete are explicit
//!    and idempotent. Maintenance sweeps apply the same transitions for queries
//!    that finished or passed their expiration.
//!
//! ## Submodules
//! - **`types`**: records, filters and the explicit query type.
//! - **`targets`**: intersection of filter dimensions into a node set.
//! - **`manager`**: the `QueryManager` store and operations.

pub mod types;
pub mod targets;
pub mod manager;
