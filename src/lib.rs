//! chat-relay: authenticated chat-completion relay.
//!
//! Verifies Firebase ID tokens in front of an OpenAI-compatible LLM API,
//! relaying completions as JSON or as a Server-Sent Events stream, and
//! exposes the caller's profile from the identity provider.

pub mod config;
pub mod error;
pub mod identity;
pub mod llm;
pub mod server;
