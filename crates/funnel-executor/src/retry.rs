use std::time::Duration;

use funnel_core::{backoff_delay, BackoffPolicy};

use crate::agent::AgentError;

/// Classification of an agent failure, deciding retry versus degrade.
/// Pure; the executor applies it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Timeout,
    Transient,
    Fatal,
    /// The agent answered for the wrong phase.
    ContractViolation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Degrade { reason: String },
}

pub fn classify(err: &AgentError) -> FailureClass {
    match err {
        AgentError::Timeout(_) => FailureClass::Timeout,
        AgentError::Transient(_) => FailureClass::Transient,
        AgentError::Fatal(_) => FailureClass::Fatal,
        AgentError::Contract(_) => FailureClass::ContractViolation,
    }
}

/// `attempt_number` is the 1-based attempt that just failed; a phase gets
/// `1 + retry_limit` attempts in total.
pub fn decide_retry(class: FailureClass, attempt_number: u32, retry_limit: u32, backoff: &BackoffPolicy) -> RetryDecision {
    match class {
        FailureClass::Timeout | FailureClass::Transient if attempt_number <= retry_limit => {
            RetryDecision::RetryAfter(backoff_delay(backoff, attempt_number + 1))
        }
        FailureClass::Timeout | FailureClass::Transient => RetryDecision::Degrade {
            reason: format!("retries exhausted after {attempt_number} attempts"),
        },
        FailureClass::Fatal => RetryDecision::Degrade { reason: "agent failed permanently".into() },
        FailureClass::ContractViolation => RetryDecision::Degrade { reason: "agent broke the phase contract".into() },
    }
}
