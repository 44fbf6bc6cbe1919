use chrono::Datelike;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_rule(input: &NewAvailability) -> Result<(), EngineError> {
    if input.start_time >= input.end_time {
        return Err(EngineError::Invalid("start time must be before end time"));
    }
    if input.title.trim().is_empty() {
        return Err(EngineError::Invalid("title is required"));
    }
    if input.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if input.color.len() > MAX_COLOR_LEN {
        return Err(EngineError::LimitExceeded("color too long"));
    }
    if let Some(rep) = &input.repeating {
        if rep.interval == 0 {
            return Err(EngineError::Invalid("repeat interval must be at least 1"));
        }
        if rep.interval > MAX_REPEAT_INTERVAL {
            return Err(EngineError::LimitExceeded("repeat interval too large"));
        }
        if let Some(end) = rep.end_date
            && end < input.start_date
        {
            return Err(EngineError::Invalid("end date precedes start date"));
        }
    }
    Ok(())
}

/// True if `candidate` overlaps any rule in `existing`.
pub fn has_conflict<'a, I>(candidate: &AvailabilityRule, existing: I) -> bool
where
    I: IntoIterator<Item = &'a AvailabilityRule>,
{
    find_conflict(candidate, existing).is_some()
}

/// First existing rule that `candidate` collides with, skipping the candidate itself.
///
/// Two rules collide only when they share a cadence, their anchor dates fall on
/// the same weekday, and their time ranges overlap (half-open). The weekday
/// test applies to every cadence, monthly and one-off included. A one-off
/// rule is never compared against a repeating one, and weekly is a different
/// cadence from biweekly.
pub fn find_conflict<'a, I>(candidate: &AvailabilityRule, existing: I) -> Option<&'a AvailabilityRule>
where
    I: IntoIterator<Item = &'a AvailabilityRule>,
{
    existing.into_iter().find(|other| {
        other.id != candidate.id
            && other.cadence() == candidate.cadence()
            && candidate.start_date.weekday() == other.start_date.weekday()
            && times_overlap(candidate, other)
    })
}

fn times_overlap(a: &AvailabilityRule, b: &AvailabilityRule) -> bool {
    a.start_time < b.end_time && a.end_time > b.start_time
}
