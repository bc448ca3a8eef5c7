//! Oracle access for OSM query parsing.
//!
//! The oracle is a failure-prone text-completion service. This crate turns a
//! query plus retrieved evidence into a prompt, calls the oracle once, recovers
//! JSON from whatever comes back, and gates it through schema validation. Every
//! failure along the way becomes a value ([`ParseOutcome`], [`LlmSignal`]) so
//! callers can fall back without handling errors.

pub mod extract;
#[cfg(feature = "llm-ollama")]
pub mod ollama;
#[cfg(feature = "llm-openai")]
pub mod openai;
pub mod oracle;
pub mod prompt;
pub mod schema;

pub use extract::{ParseOutcome, ParseStatus, RecoveryTier, StructuredResponseExtractor};
#[cfg(feature = "llm-ollama")]
pub use ollama::OllamaOracle;
#[cfg(feature = "llm-openai")]
pub use openai::OpenAiOracle;
pub use oracle::{DisabledOracle, Oracle, OracleBackend, OracleError, OracleRequest};
pub use schema::{is_valid, validate, InvalidReason, LlmSignal, StructuredResponse};
