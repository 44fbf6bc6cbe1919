use chrono::NaiveDateTime;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_NOTES_LEN;
use crate::model::*;
use crate::observability::BOOKINGS_TOTAL;

use super::occurrences::is_occurrence;
use super::policy::{check_booking_window, check_daily_cap};
use super::{Engine, EngineError, Txn};

impl Engine {
    /// Book one occurrence: debit a credit, claim the slot and consume the
    /// occurrence, all in one transaction.
    pub async fn book(&self, req: BookingRequest) -> Result<StudentClass, EngineError> {
        let result = self.book_inner(req).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn book_inner(&self, req: BookingRequest) -> Result<StudentClass, EngineError> {
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        // Cheap rejection before locking; checked again inside.
        if let Some(policy) = self.policy_hint(req.teacher_id)
            && let Err(e) = check_booking_window(&policy, req.scheduled_at, self.now())
        {
            debug!(teacher_id = %req.teacher_id, at = %req.scheduled_at, error = %e, "booking rejected by policy");
            return Err(e);
        }

        let mut txn = self.begin().await?;
        txn.lock_calendar(req.teacher_id)
            .await
            .map_err(|e| match e {
                EngineError::NotFound(_) => EngineError::NotFound(req.rule_id),
                other => other,
            })?;
        txn.lock_account(req.student_id).await?;

        let now = txn.now();
        let policy = txn.policy();
        check_booking_window(&policy, req.scheduled_at, now)?;

        let balance = txn.credits();
        if balance < 1 {
            return Err(EngineError::InsufficientCredits { balance });
        }
        if txn.active_class_at(req.scheduled_at).is_some() {
            return Err(EngineError::SlotAlreadyBooked { at: req.scheduled_at });
        }
        check_daily_cap(&policy, txn.active_classes_on(req.scheduled_at.date()))?;
        let rule = bookable_rule(&txn, req.rule_id, req.scheduled_at)?;

        let class = StudentClass {
            id: Ulid::new(),
            student_id: req.student_id,
            teacher_id: req.teacher_id,
            rule_id: Some(rule.id),
            scheduled_at: req.scheduled_at,
            duration_minutes: rule.duration_minutes(),
            status: ClassStatus::Scheduled,
            notes: req.notes,
            feedback: None,
            cancellation_reason: None,
            rescheduled_from: None,
            created_by: req.student_id,
            created_at: now,
            updated_at: now,
        };
        txn.stage(Event::ClassBooked { class: class.clone() });
        txn.stage(Event::CreditsAdjusted {
            student_id: req.student_id,
            entry: CreditEntry {
                at: now,
                delta: -1,
                reason: CreditReason::Booking,
                class_id: Some(class.id),
                note: None,
            },
        });
        txn.stage(consume(&rule, &class));
        txn.commit().await?;

        info!(
            class_id = %class.id,
            student_id = %class.student_id,
            teacher_id = %class.teacher_id,
            at = %class.scheduled_at,
            "class booked"
        );
        Ok(class)
    }

    /// Move a scheduled class to another occurrence of the same teacher.
    /// The old class becomes `rescheduled`, its occurrence reopens, and no
    /// credit moves.
    pub async fn reschedule(
        &self,
        student_id: Ulid,
        class_id: Ulid,
        rule_id: Ulid,
        new_scheduled_at: NaiveDateTime,
    ) -> Result<StudentClass, EngineError> {
        let teacher_id = self
            .store
            .owner_of_class(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        if let Some(policy) = self.policy_hint(teacher_id) {
            check_booking_window(&policy, new_scheduled_at, self.now())?;
        }

        let mut txn = self.begin().await?;
        txn.lock_calendar(teacher_id).await?;

        let old = txn.class(&class_id).cloned().ok_or(EngineError::NotFound(class_id))?;
        if old.student_id != student_id {
            return Err(EngineError::NotOwner(class_id));
        }
        if old.status != ClassStatus::Scheduled {
            return Err(EngineError::InvalidTransition {
                from: old.status,
                to: ClassStatus::Rescheduled,
            });
        }
        if old.scheduled_at == new_scheduled_at {
            return Err(EngineError::Invalid("class is already at that time"));
        }

        let now = txn.now();
        let policy = txn.policy();
        check_booking_window(&policy, new_scheduled_at, now)?;
        if txn.active_class_at(new_scheduled_at).is_some() {
            return Err(EngineError::SlotAlreadyBooked { at: new_scheduled_at });
        }
        let new_date = new_scheduled_at.date();
        let mut same_day = txn.active_classes_on(new_date);
        if old.scheduled_at.date() == new_date {
            same_day = same_day.saturating_sub(1);
        }
        check_daily_cap(&policy, same_day)?;
        let rule = bookable_rule(&txn, rule_id, new_scheduled_at)?;

        let class = StudentClass {
            id: Ulid::new(),
            rule_id: Some(rule.id),
            scheduled_at: new_scheduled_at,
            duration_minutes: rule.duration_minutes(),
            status: ClassStatus::Scheduled,
            feedback: None,
            cancellation_reason: None,
            rescheduled_from: Some(old.id),
            created_by: student_id,
            created_at: now,
            updated_at: now,
            ..old.clone()
        };
        txn.stage(Event::ClassStatusChanged {
            teacher_id,
            class_id: old.id,
            status: ClassStatus::Rescheduled,
            feedback: None,
            reason: None,
            at: now,
        });
        if let Some(release) = release_consumed(&txn, &old) {
            txn.stage(release);
        }
        txn.stage(Event::ClassBooked { class: class.clone() });
        txn.stage(consume(&rule, &class));
        txn.commit().await?;

        info!(
            class_id = %class.id,
            rescheduled_from = %old.id,
            at = %class.scheduled_at,
            "class rescheduled"
        );
        Ok(class)
    }

    /// Committed policy for a teacher, or the configured default.
    pub async fn policy_for(&self, teacher_id: Ulid) -> SchedulingPolicy {
        match self.store.calendar(&teacher_id) {
            Some(shared) => self.policy_of(Some(&*shared.read().await)),
            None => self.config.default_policy,
        }
    }

    /// Policy without waiting; `None` while a writer holds the calendar.
    fn policy_hint(&self, teacher_id: Ulid) -> Option<SchedulingPolicy> {
        match self.store.calendar(&teacher_id) {
            Some(shared) => shared.try_read().ok().map(|cal| self.policy_of(Some(&*cal))),
            None => Some(self.config.default_policy),
        }
    }
}

/// The rule whose occurrence starts exactly at `at`, if it can be booked.
fn bookable_rule(txn: &Txn<'_>, rule_id: Ulid, at: NaiveDateTime) -> Result<AvailabilityRule, EngineError> {
    let Some(rule) = txn.rule(&rule_id) else {
        return Err(match txn.engine().store.owner_of_rule(&rule_id) {
            Some(_) => EngineError::NotOwner(rule_id),
            None => EngineError::NotFound(rule_id),
        });
    };
    let date = at.date();
    if at.time() != rule.start_time || !is_occurrence(rule, date) {
        return Err(EngineError::OccurrenceUnavailable { rule_id, at });
    }
    match txn.exception(&rule_id, date).map(|e| e.kind) {
        Some(ExceptionKind::Cancelled) => Err(EngineError::OccurrenceUnavailable { rule_id, at }),
        Some(ExceptionKind::ConsumedByBooking) => Err(EngineError::SlotAlreadyBooked { at }),
        None => Ok(rule.clone()),
    }
}

fn consume(rule: &AvailabilityRule, class: &StudentClass) -> Event {
    Event::ExceptionAdded {
        exception: AvailabilityException {
            id: Ulid::new(),
            rule_id: rule.id,
            teacher_id: rule.teacher_id,
            occurrence_date: class.scheduled_at.date(),
            kind: ExceptionKind::ConsumedByBooking,
            class_id: Some(class.id),
        },
    }
}

/// Removal of the exception `class` consumed, if it still links to it.
pub(super) fn release_consumed(txn: &Txn<'_>, class: &StudentClass) -> Option<Event> {
    let rule_id = class.rule_id?;
    let date = class.scheduled_at.date();
    let exception = txn.exception(&rule_id, date)?;
    (exception.kind == ExceptionKind::ConsumedByBooking && exception.class_id == Some(class.id)).then(
        || Event::ExceptionRemoved {
            teacher_id: class.teacher_id,
            rule_id,
            date,
        },
    )
}
