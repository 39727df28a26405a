//! Agent-side behavior: the worker event loop, sub-task spec extraction,
//! critique handling, system prompt assembly, and the tool dispatcher seam.

pub mod critique;
pub mod output;
pub mod prompts;
pub mod spec;
pub mod tools;
pub mod worker;
