use chrono::{NaiveDateTime, TimeDelta};

use crate::model::SchedulingPolicy;

use super::EngineError;

/// Lead time and horizon checks. `scheduled_at == now + lead` is accepted.
pub(crate) fn check_booking_window(
    policy: &SchedulingPolicy,
    scheduled_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    if let Some(earliest) =
        now.checked_add_signed(TimeDelta::hours(policy.booking_lead_time_hours as i64))
        && scheduled_at < earliest
    {
        return Err(EngineError::LeadTimeViolation { earliest });
    }
    if policy.booking_horizon_days > 0
        && let Some(latest) =
            now.checked_add_signed(TimeDelta::days(policy.booking_horizon_days as i64))
        && scheduled_at > latest
    {
        return Err(EngineError::HorizonViolation { latest });
    }
    Ok(())
}

pub(crate) fn check_daily_cap(policy: &SchedulingPolicy, booked_that_day: usize) -> Result<(), EngineError> {
    let cap = policy.max_occasional_classes_per_day;
    if cap > 0 && booked_that_day >= cap as usize {
        return Err(EngineError::DailyCapExceeded { cap });
    }
    Ok(())
}

/// A student cancellation is refunded only when strictly more than
/// `cancellation_policy_hours` remain before the class.
pub fn refund_eligible(policy: &SchedulingPolicy, scheduled_at: NaiveDateTime, now: NaiveDateTime) -> bool {
    scheduled_at - now > TimeDelta::hours(policy.cancellation_policy_hours as i64)
}
