//! Request routing core for Switchyard
//!
//! Exposes one OpenAI-compatible chat-completion surface over heterogeneous
//! backends: stateless ones that take the full history (`OpenAI`, Anthropic)
//! and a stateful one that continues a server-side conversation from a
//! continuation token. Routing, protocol translation and session chains
//! live here; the server crate only assembles them.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod backend;
pub mod convert;
pub mod error;
#[cfg(feature = "http")]
pub mod handler;
pub mod health;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
#[cfg(test)]
mod test_support;
pub mod types;

pub use backend::{Backend, BackendDescriptor, EventStream, Exchange, StreamStart};
pub use error::{Attempt, LlmError};
#[cfg(feature = "http")]
pub use handler::llm_router;
pub use registry::{BackendFactory, BackendSource, FileSource, Registry, Snapshot, StaticSource, http_factory};
pub use router::{RequestRouter, RoutedStream};
pub use session::{Clock, ManualClock, SessionContext, SessionManager, SystemClock, TurnGuard};
pub use types::{CompletionRequest, CompletionResponse, StreamEvent};
