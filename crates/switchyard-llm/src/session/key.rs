//! Conversation key derivation
//!
//! A conversation's prefix (its leading system messages and first user
//! message) never changes as turns are appended, so hashing it gives a key
//! that is stable across the whole conversation without any caller-side
//! state.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::types::{Message, Role};

const DERIVED_PREFIX: &str = "ck:";
const EXPLICIT_PREFIX: &str = "sid:";

/// Derive the conversation key from the immutable prefix of `messages`
///
/// Returns `None` when there is no user message to anchor the key.
pub fn derive(messages: &[Message]) -> Option<String> {
    let first_user = messages.iter().find(|m| m.role == Role::User)?;

    let mut hasher = Sha256::new();
    for message in messages.iter().take_while(|m| m.role == Role::System) {
        update(&mut hasher, message);
    }
    update(&mut hasher, first_user);

    let digest = hasher.finalize();
    let mut key = String::with_capacity(DERIVED_PREFIX.len() + digest.len() * 2);
    key.push_str(DERIVED_PREFIX);
    for byte in digest {
        let _ = write!(key, "{byte:02x}");
    }
    Some(key)
}

/// Key for a caller-supplied session id
pub fn explicit(session_id: &str) -> String {
    format!("{EXPLICIT_PREFIX}{session_id}")
}

/// Whether `key` was built from an explicit session id
pub fn is_explicit(key: &str) -> bool {
    key.starts_with(EXPLICIT_PREFIX)
}

// Length prefixes keep ("ab", "c") and ("a", "bc") apart
fn update(hasher: &mut Sha256, message: &Message) {
    let role = message.role.as_str().as_bytes();
    let text = message.content.as_text();

    hasher.update((role.len() as u64).to_be_bytes());
    hasher.update(role);
    hasher.update((text.len() as u64).to_be_bytes());
    hasher.update(text.as_bytes());
}
