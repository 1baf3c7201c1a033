//! cimend HTTP collaborators
//!
//! - [`GitHubClient`]: [`SourceControl`](cimend_core::SourceControl) over the GitHub REST API
//! - [`ChatCompletionsProvider`]: [`Provider`](cimend_core::Provider) over an
//!   OpenAI-compatible `/chat/completions` endpoint

pub mod chat;
pub mod github;
pub mod status;

pub use chat::{ChatCompletionsProvider, ChatConfig};
pub use github::{GitHubClient, GitHubConfig};
