//! Triage pipeline.
//!
//! Every inbound record flows through:
//! 1. `Redactor::redact()`: personal data removed before analysis
//! 2. `Analyzer::analyze()`: structured intent / sentiment / confidence
//! 3. `PriorityClassifier::classify()`: ordered first-match rules
//! 4. `ReplyGate::decide()`: five layers, approved template or NO_REPLY
//!
//! **No auto-send path exists.** A drafted reply always waits for a human.

pub mod collaborators;
pub mod gate;
pub mod policy;
pub mod processor;
pub mod retry;
pub mod rules;
pub mod types;
pub mod worker;

pub use collaborators::{Analyzer, MailFetcher, Redactor, ReplyDispatcher};
pub use gate::{NO_REPLY, ReplyDecision, ReplyGate};
pub use policy::TriagePolicy;
pub use processor::RecordProcessor;
pub use retry::RetryPolicy;
pub use rules::PriorityClassifier;
