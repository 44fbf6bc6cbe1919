use tracing::info;
use ulid::Ulid;

use crate::limits::{MAX_FEEDBACK_LEN, MAX_REASON_LEN};
use crate::model::*;
use crate::observability::CANCELLATIONS_TOTAL;

use super::booking::release_consumed;
use super::policy::refund_eligible;
use super::{Engine, EngineError, Txn};

impl Engine {
    /// Student cancellation. Refunds the credit and reopens the occurrence
    /// only when more than `cancellation_policy_hours` remain.
    pub async fn cancel_by_student(&self, student_id: Ulid, class_id: Ulid) -> Result<CancellationOutcome, EngineError> {
        let mut txn = self.begin().await?;
        let class = lock_class(&mut txn, class_id).await?;
        if class.student_id != student_id {
            return Err(EngineError::NotOwner(class_id));
        }
        ensure_scheduled(&class, ClassStatus::CanceledByStudent)?;
        txn.lock_account_or_create(student_id).await?;

        let now = txn.now();
        let policy = txn.policy();
        let refunded = refund_eligible(&policy, class.scheduled_at, now);

        txn.stage(Event::ClassStatusChanged {
            teacher_id: class.teacher_id,
            class_id,
            status: ClassStatus::CanceledByStudent,
            feedback: None,
            reason: None,
            at: now,
        });
        if refunded {
            txn.stage(credit(student_id, 1, CreditReason::Refund, &class, now));
            if let Some(release) = release_consumed(&txn, &class) {
                txn.stage(release);
            }
        }
        let class = commit_class(txn, class_id).await?;

        metrics::counter!(CANCELLATIONS_TOTAL, "by" => "student", "refunded" => refunded.to_string())
            .increment(1);
        info!(%class_id, %student_id, refunded, "class cancelled by student");

        let message = if refunded {
            "Class cancelled. Your credit has been refunded.".to_string()
        } else {
            format!(
                "Class cancelled less than {} hours before it starts. The credit is not refunded.",
                policy.cancellation_policy_hours
            )
        };
        Ok(CancellationOutcome {
            class,
            refunded,
            message,
        })
    }

    /// Teacher cancellation. Without a makeup the student's credit comes back;
    /// with one, the student instead gains a makeup entitlement. Either way the
    /// occurrence stays closed.
    pub async fn cancel_by_teacher(
        &self,
        teacher_id: Ulid,
        class_id: Ulid,
        reason: String,
        allow_makeup: bool,
    ) -> Result<CancellationOutcome, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let status = if allow_makeup {
            ClassStatus::CanceledByTeacherWithMakeup
        } else {
            ClassStatus::CanceledByTeacher
        };

        let mut txn = self.begin().await?;
        let class = lock_class(&mut txn, class_id).await?;
        if class.teacher_id != teacher_id {
            return Err(EngineError::NotOwner(class_id));
        }
        ensure_scheduled(&class, status)?;
        txn.lock_account_or_create(class.student_id).await?;
        let now = txn.now();

        txn.stage(Event::ClassStatusChanged {
            teacher_id,
            class_id,
            status,
            feedback: None,
            reason: Some(reason),
            at: now,
        });
        let reason = if allow_makeup {
            CreditReason::MakeupEntitlement
        } else {
            CreditReason::TeacherCancellation
        };
        txn.stage(credit(class.student_id, 1, reason, &class, now));
        if let Some(rule_id) = class.rule_id
            && txn
                .exception(&rule_id, class.scheduled_at.date())
                .is_some_and(|e| e.class_id == Some(class_id))
        {
            txn.stage(Event::ExceptionAdded {
                exception: AvailabilityException {
                    id: Ulid::new(),
                    rule_id,
                    teacher_id,
                    occurrence_date: class.scheduled_at.date(),
                    kind: ExceptionKind::Cancelled,
                    class_id: Some(class_id),
                },
            });
        }
        let class = commit_class(txn, class_id).await?;

        let refunded = !allow_makeup;
        metrics::counter!(CANCELLATIONS_TOTAL, "by" => "teacher", "refunded" => refunded.to_string())
            .increment(1);
        info!(%class_id, %teacher_id, allow_makeup, "class cancelled by teacher");

        let message = if allow_makeup {
            "Class cancelled by the teacher. A makeup class has been credited.".to_string()
        } else {
            "Class cancelled by the teacher. Your credit has been refunded.".to_string()
        };
        Ok(CancellationOutcome {
            class,
            refunded,
            message,
        })
    }

    /// Non-cancelling status writes (completed, no-show, overdue, ...).
    /// Cancellation and rescheduling have their own operations.
    pub async fn update_class_status(
        &self,
        class_id: Ulid,
        status: ClassStatus,
        feedback: Option<String>,
    ) -> Result<StudentClass, EngineError> {
        if feedback.as_ref().is_some_and(|f| f.len() > MAX_FEEDBACK_LEN) {
            return Err(EngineError::LimitExceeded("feedback too long"));
        }
        let mut txn = self.begin().await?;
        let class = lock_class(&mut txn, class_id).await?;
        ensure_active(&class, status)?;
        if !status.is_active() {
            return Err(EngineError::InvalidTransition {
                from: class.status,
                to: status,
            });
        }

        let at = txn.now();
        txn.stage(Event::ClassStatusChanged {
            teacher_id: class.teacher_id,
            class_id,
            status,
            feedback,
            reason: None,
            at,
        });
        let updated = commit_class(txn, class_id).await?;
        info!(%class_id, from = %class.status, to = %status, "class status updated");
        Ok(updated)
    }
}

/// Lock the calendar owning `class_id` and return the class as committed.
async fn lock_class(txn: &mut Txn<'_>, class_id: Ulid) -> Result<StudentClass, EngineError> {
    let teacher_id = txn
        .engine()
        .store
        .owner_of_class(&class_id)
        .ok_or(EngineError::NotFound(class_id))?;
    txn.lock_calendar(teacher_id).await?;
    txn.class(&class_id).cloned().ok_or(EngineError::NotFound(class_id))
}

fn ensure_active(class: &StudentClass, to: ClassStatus) -> Result<(), EngineError> {
    if class.status.is_active() {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: class.status,
            to,
        })
    }
}

/// Only a class that has not happened yet can be cancelled.
fn ensure_scheduled(class: &StudentClass, to: ClassStatus) -> Result<(), EngineError> {
    if class.status == ClassStatus::Scheduled {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: class.status,
            to,
        })
    }
}

async fn commit_class(txn: Txn<'_>, class_id: Ulid) -> Result<StudentClass, EngineError> {
    txn.commit_then(|t| t.class(&class_id).cloned())
        .await?
        .ok_or(EngineError::NotFound(class_id))
}

fn credit(
    student_id: Ulid,
    delta: i64,
    reason: CreditReason,
    class: &StudentClass,
    at: chrono::NaiveDateTime,
) -> Event {
    Event::CreditsAdjusted {
        student_id,
        entry: CreditEntry {
            at,
            delta,
            reason,
            class_id: Some(class.id),
            note: None,
        },
    }
}
