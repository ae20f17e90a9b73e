//! Port-conflict decision
//!
//! When another `llama-server` already holds the port, the launcher asks
//! the front-end what to do and awaits the answer.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Leave the existing server alone and abort the launch
    Cancel,
    /// Stop the existing server, don't start a new one
    StopOnly,
    /// Stop the existing server, then launch
    StopAndContinue,
}

impl fmt::Display for ConflictDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictDecision::Cancel => write!(f, "cancel"),
            ConflictDecision::StopOnly => write!(f, "stop"),
            ConflictDecision::StopAndContinue => write!(f, "replace"),
        }
    }
}

impl FromStr for ConflictDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" | "cancel" | "n" | "no" => Ok(ConflictDecision::Cancel),
            "s" | "stop" => Ok(ConflictDecision::StopOnly),
            "y" | "yes" | "r" | "replace" => Ok(ConflictDecision::StopAndContinue),
            other => Err(format!("unknown decision: {}", other)),
        }
    }
}

/// Front-end hook for the three-way port-conflict question
#[async_trait]
pub trait ConflictPrompt: Send + Sync {
    async fn resolve_conflict(&self, port: u16, pid: u32) -> ConflictDecision;
}

/// Answers every conflict the same way (non-interactive runs)
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub ConflictDecision);

#[async_trait]
impl ConflictPrompt for FixedDecision {
    async fn resolve_conflict(&self, port: u16, pid: u32) -> ConflictDecision {
        tracing::info!(
            "Server already on port {} (PID {}), answering {}",
            port,
            pid,
            self.0
        );
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decisions() {
        assert_eq!("c".parse(), Ok(ConflictDecision::Cancel));
        assert_eq!(" Stop ".parse(), Ok(ConflictDecision::StopOnly));
        assert_eq!("y".parse(), Ok(ConflictDecision::StopAndContinue));
        assert_eq!("replace".parse(), Ok(ConflictDecision::StopAndContinue));
        assert!("maybe".parse::<ConflictDecision>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for decision in [
            ConflictDecision::Cancel,
            ConflictDecision::StopOnly,
            ConflictDecision::StopAndContinue,
        ] {
            assert_eq!(decision.to_string().parse(), Ok(decision));
        }
    }

    #[tokio::test]
    async fn test_fixed_decision() {
        let prompt = FixedDecision(ConflictDecision::StopOnly);
        assert_eq!(prompt.resolve_conflict(8080, 42).await, ConflictDecision::StopOnly);
    }
}
