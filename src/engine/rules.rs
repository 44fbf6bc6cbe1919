use chrono::{Days, NaiveDate};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_RULES_PER_TEACHER;
use crate::model::*;
use crate::observability::RULE_CONFLICTS_TOTAL;

use super::conflict::{find_conflict, validate_rule};
use super::occurrences::is_occurrence;
use super::{Engine, EngineError, Txn};

impl Engine {
    /// Store a teacher's scheduling policy (settings collaborator entry point).
    pub async fn set_policy(&self, teacher_id: Ulid, policy: SchedulingPolicy) -> Result<(), EngineError> {
        let mut txn = self.begin().await?;
        txn.lock_calendar_or_create(teacher_id).await?;
        txn.stage(Event::PolicySet { teacher_id, policy });
        txn.commit().await?;
        info!(%teacher_id, ?policy, "policy set");
        Ok(())
    }

    pub async fn declare_availability(&self, input: NewAvailability) -> Result<AvailabilityRule, EngineError> {
        validate_rule(&input)?;
        let teacher_id = input.teacher_id;
        let rule = input.into_rule(Ulid::new());

        let mut txn = self.begin().await?;
        txn.lock_calendar_or_create(teacher_id).await?;
        let Some(cal) = txn.calendar() else {
            return Err(EngineError::NotFound(teacher_id));
        };
        if cal.availability.rule_count() >= MAX_RULES_PER_TEACHER {
            return Err(EngineError::LimitExceeded("too many availability rules"));
        }
        reject_conflict(&rule, cal.availability.rules())?;

        txn.stage(Event::RuleDeclared { rule: rule.clone() });
        txn.commit().await?;
        info!(rule_id = %rule.id, %teacher_id, "availability declared");
        Ok(rule)
    }

    /// Edit a rule in place. Existing exceptions and bookings are untouched.
    pub async fn update_availability(
        &self,
        teacher_id: Ulid,
        rule_id: Ulid,
        input: NewAvailability,
    ) -> Result<AvailabilityRule, EngineError> {
        if input.teacher_id != teacher_id {
            return Err(EngineError::NotOwner(rule_id));
        }
        validate_rule(&input)?;
        let rule = input.into_rule(rule_id);

        let mut txn = self.begin().await?;
        lock_rule_owner(&mut txn, teacher_id, rule_id).await?;
        let Some(cal) = txn.calendar() else {
            return Err(EngineError::NotFound(rule_id));
        };
        reject_conflict(&rule, cal.availability.rules())?;

        txn.stage(Event::RuleUpdated { rule: rule.clone() });
        txn.commit().await?;
        info!(%rule_id, %teacher_id, "availability updated");
        Ok(rule)
    }

    /// Delete one occurrence (`Single`) or this and every later occurrence
    /// (`Future`). Non-repeating rules are removed outright either way.
    pub async fn delete_availability(
        &self,
        teacher_id: Ulid,
        rule_id: Ulid,
        delete_type: DeleteType,
        occurrence_date: NaiveDate,
    ) -> Result<(), EngineError> {
        let mut txn = self.begin().await?;
        lock_rule_owner(&mut txn, teacher_id, rule_id).await?;
        let rule = txn.rule(&rule_id).cloned().ok_or(EngineError::NotFound(rule_id))?;

        let event = match (rule.repeating, delete_type) {
            (None, _) => Some(Event::RuleDeleted { teacher_id, rule_id }),
            (Some(_), DeleteType::Single) => cancel_occurrence(&txn, &rule, occurrence_date)?,
            (Some(rep), DeleteType::Future) => {
                let cut = occurrence_date
                    .checked_sub_days(Days::new(1))
                    .ok_or(EngineError::Invalid("occurrence date out of range"))?;
                if cut < rule.start_date {
                    Some(Event::RuleDeleted { teacher_id, rule_id })
                } else {
                    let mut truncated = rule.clone();
                    truncated.repeating = Some(Repeating {
                        end_date: Some(rep.end_date.map_or(cut, |end| end.min(cut))),
                        ..rep
                    });
                    Some(Event::RuleUpdated { rule: truncated })
                }
            }
        };

        let Some(event) = event else {
            debug!(%rule_id, %occurrence_date, "occurrence already cancelled");
            return Ok(());
        };
        txn.stage(event);
        txn.commit().await?;
        info!(%rule_id, %teacher_id, ?delete_type, %occurrence_date, "availability deleted");
        Ok(())
    }
}

fn reject_conflict<'a>(
    rule: &AvailabilityRule,
    existing: impl IntoIterator<Item = &'a AvailabilityRule>,
) -> Result<(), EngineError> {
    if let Some(other) = find_conflict(rule, existing) {
        metrics::counter!(RULE_CONFLICTS_TOTAL).increment(1);
        debug!(rule_id = %rule.id, existing = %other.id, "availability conflict");
        return Err(EngineError::Conflict { existing: other.id });
    }
    Ok(())
}

/// Lock the calendar that owns `rule_id`, checking it belongs to `teacher_id`.
async fn lock_rule_owner(txn: &mut Txn<'_>, teacher_id: Ulid, rule_id: Ulid) -> Result<(), EngineError> {
    let owner = txn
        .engine()
        .store
        .owner_of_rule(&rule_id)
        .ok_or(EngineError::NotFound(rule_id))?;
    if owner != teacher_id {
        return Err(EngineError::NotOwner(rule_id));
    }
    txn.lock_calendar(owner).await?;
    // The rule may have been deleted while we waited for the lock.
    if txn.rule(&rule_id).is_none() {
        return Err(EngineError::NotFound(rule_id));
    }
    Ok(())
}

/// Event for a single-occurrence delete, or `None` if already cancelled.
fn cancel_occurrence(txn: &Txn<'_>, rule: &AvailabilityRule, date: NaiveDate) -> Result<Option<Event>, EngineError> {
    if !is_occurrence(rule, date) {
        return Err(EngineError::OccurrenceUnavailable {
            rule_id: rule.id,
            at: date.and_time(rule.start_time),
        });
    }
    match txn.exception(&rule.id, date) {
        Some(e) if e.kind == ExceptionKind::Cancelled => Ok(None),
        Some(e) => Err(EngineError::OccurrenceBooked {
            date,
            class_id: e.class_id.unwrap_or(e.id),
        }),
        None => Ok(Some(Event::ExceptionAdded {
            exception: AvailabilityException {
                id: Ulid::new(),
                rule_id: rule.id,
                teacher_id: rule.teacher_id,
                occurrence_date: date,
                kind: ExceptionKind::Cancelled,
                class_id: None,
            },
        })),
    }
}
