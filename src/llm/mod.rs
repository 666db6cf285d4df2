//! LLM domain: vision analysis of captured regions.
//!
//! Public API for the remote analysis client.
//! External code should only use the items exported here.
//!
//!   - client.rs     - AnalysisClient: credential check, rate limit, one HTTP call
//!   - rate_limit.rs - fixed-window local request budget
//!   - provider.rs   - endpoint, model and sampling defaults
//!   - types.rs      - chat-completions wire types + AnalysisResult

mod client;
pub mod provider;
pub mod rate_limit;
pub mod types;

pub use client::{AnalysisClient, AnalysisError, CredentialSource};
pub use provider::ProviderConfig;
pub use types::{AnalysisResult, Usage};
