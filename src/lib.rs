//! Child-safety core for the classroom gaming platform: a layered detector
//! (text classification, behavioral anomalies, social co-presence analysis)
//! feeding a stateful incident ledger with escalating consequences and alert
//! fan-out.

pub mod behavior;
pub mod classifier;
pub mod db;
pub mod error;
pub mod ledger;
pub mod lexicon;
pub mod models;
pub mod orchestrator;
pub mod report;
pub mod social;
pub mod store;

pub use error::SafetyError;
pub use ledger::{IncidentLedger, ReviewDecision};
pub use orchestrator::SafetyOrchestrator;
