//! Wire formats, one module per protocol
//!
//! `openai` doubles as the public schema served to callers.

pub mod anthropic;
pub mod openai;
pub mod threaded;
