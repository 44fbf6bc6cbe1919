use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;
use ulid::Ulid;

use crate::model::ClassStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("{0} does not belong to the caller")]
    NotOwner(Ulid),
    #[error("availability overlaps existing rule {existing}")]
    Conflict { existing: Ulid },
    #[error("classes must be booked at or after {earliest}")]
    LeadTimeViolation { earliest: NaiveDateTime },
    #[error("classes cannot be booked after {latest}")]
    HorizonViolation { latest: NaiveDateTime },
    #[error("daily limit of {cap} classes reached")]
    DailyCapExceeded { cap: u32 },
    #[error("insufficient credits: balance is {balance}")]
    InsufficientCredits { balance: u32 },
    #[error("slot at {at} is already booked")]
    SlotAlreadyBooked { at: NaiveDateTime },
    #[error("rule {rule_id} has no bookable occurrence at {at}")]
    OccurrenceUnavailable { rule_id: Ulid, at: NaiveDateTime },
    #[error("occurrence on {date} is booked by class {class_id}")]
    OccurrenceBooked { date: NaiveDate, class_id: Ulid },
    #[error("cannot move class from {from} to {to}")]
    InvalidTransition { from: ClassStatus, to: ClassStatus },
    #[error("invalid input: {0}")]
    Invalid(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
    #[error("journal error: {0}")]
    Journal(String),
}

impl EngineError {
    /// True when the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransactionAborted(_))
    }

    /// Short stable label, used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::NotOwner(_) => "not_owner",
            EngineError::Conflict { .. } => "conflict",
            EngineError::LeadTimeViolation { .. } => "lead_time",
            EngineError::HorizonViolation { .. } => "horizon",
            EngineError::DailyCapExceeded { .. } => "daily_cap",
            EngineError::InsufficientCredits { .. } => "insufficient_credits",
            EngineError::SlotAlreadyBooked { .. } => "slot_already_booked",
            EngineError::OccurrenceUnavailable { .. } => "occurrence_unavailable",
            EngineError::OccurrenceBooked { .. } => "occurrence_booked",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Invalid(_) => "invalid",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::TransactionAborted(_) => "aborted",
            EngineError::Journal(_) => "journal",
        }
    }
}
