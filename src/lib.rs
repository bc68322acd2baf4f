pub mod agent;
pub mod chain;
pub mod collaborators;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod message;
pub mod processor;
pub mod profile;
pub mod retry;
pub mod scanner;
pub mod session;
pub mod strategy;
pub mod verifier;
pub mod vision;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentStatus, CycleReport};
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
