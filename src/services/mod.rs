pub mod compiler;
pub mod discovery;
pub mod journal;
pub mod llm_service;
pub mod prompts;
pub mod report;
pub mod scorer;
pub mod test_runner;

pub use compiler::Compiler;
pub use discovery::{Discovery, DiscoveryReport};
pub use journal::{Journal, JournalSnapshot};
pub use llm_service::{LlmService, UnconfiguredOracle};
pub use scorer::{OracleScore, PartialCreditScorer, RetryPolicy, ScoringOracle, ScoringRequest};
pub use test_runner::{OutputComparison, TestRunner};
