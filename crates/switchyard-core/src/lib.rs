//! Shared request context and error contracts for Switchyard crates

#![allow(clippy::must_use_candidate)]

mod context;
mod error;

pub use context::{BACKEND_HEADER, REQUEST_ID_HEADER, RequestContext, SESSION_HEADER};
pub use error::HttpError;
