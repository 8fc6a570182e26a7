//! Protocol Transformer: canonical types to and from each wire format
//!
//! Stateless backends get the full history remapped field by field. The
//! threaded backend gets only the newest turn plus its continuation token,
//! with tool calls expressed through the markup convention in [`markup`].

pub mod anthropic;
pub mod markup;
pub mod openai;
pub mod threaded;
