//! Fleet Data-Plane Library
//!
//! Core modules of a command-and-control service for osquery agents that poll
//! a central server. The binary (`main.rs`) wires them behind one HTTP router.
//!
//! ## Architecture Modules
//! - **`queries`**: distributed query records, target resolution by filter
//!   intersection, per-node assignment and the poll contract.
//! - **`carves`**: the chunked file-extraction session state machine, block
//!   storage per carver and artifact reconstruction (local or S3 multipart).
//! - **`batch`**: the coalescing writer that turns per-request liveness
//!   signals into periodic bulk last-seen updates.
//! - **`nodes`** / **`environments`**: the in-memory directory collaborators.
//! - **`logging`**: the single log sink fed by node Log and QueryWrite traffic.
//! - **`tls`** / **`admin`**: thin HTTP adapters for agents and operators.
//! - **`fleet`**: the shared context and router assembly.

pub mod admin;
pub mod batch;
pub mod carves;
pub mod config;
pub mod environments;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod nodes;
pub mod queries;
pub mod tls;
