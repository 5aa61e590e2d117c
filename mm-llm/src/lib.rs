//! Generation-backend client for Murmur.
//!
//! Speaks the OpenAI-compatible chat-completions wire format so any
//! compatible endpoint (DeepSeek, OpenAI, local proxies) can back the agent.

mod client;
mod error;
mod types;

pub use client::ChatClient;
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Role};
