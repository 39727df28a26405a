//! Core data model and durable state for relay.
//!
//! This crate owns everything the rest of the workspace coordinates through:
//! the task record and its status state machine, the file-locked task board,
//! the parent→children sub-task registry, the workspace directory layout,
//! and the TOML configuration document.
//!
//! All shared state is a plain JSON document on disk guarded by a sibling
//! lockfile; see [`lockfile`] and [`store`] for the locking and atomic-write
//! machinery.

pub mod board;
pub mod config;
pub mod lockfile;
pub mod paths;
pub mod store;
pub mod subtasks;
pub mod types;
