//! Admin API Module
//!
//! JSON endpoints under `/api/v1` for operators: run queries and carves,
//! inspect and transition them, archive and download carve artifacts, and
//! keep a per-creator library of saved queries.
//! Environments are addressed by UUID or name. Errors are `FleetError`s
//! rendered through `IntoResponse`.

pub mod handlers;
pub mod protocol;
