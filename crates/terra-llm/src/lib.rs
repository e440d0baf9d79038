//! Client for the local agent server: an OpenAI-compatible chat endpoint
//! plus a tokenize endpoint. Transient failures retry with exponential
//! backoff; everything else surfaces as a typed [`AgentError`].

pub mod client;
pub mod error;
pub mod mock;

pub use client::{AgentApi, AgentClient, ChatRequest, ChatResponse, ClientConfig};
pub use error::AgentError;
pub use mock::{MockAgent, MockResponse};
