//! File-backed coordination primitives shared by all agent processes:
//! the layered context bus, per-agent mailboxes, the cross-process wakeup
//! bus, heartbeat files, and the in-process shutdown signal.

pub mod context;
pub mod heartbeat;
pub mod mailbox;
pub mod shutdown;
pub mod wakeup;
