//! Tracing initialisation and append-only audit logs.

pub mod audit;
pub mod logging;
