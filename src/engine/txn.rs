use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::{OwnedRwLockWriteGuard, RwLockReadGuard};
use ulid::Ulid;

use crate::calendar::{StudentAccount, TeacherCalendar};
use crate::model::*;
use crate::observability::COMMIT_DURATION_SECONDS;

use super::{Engine, EngineError};

/// Unit of work over one teacher calendar and at most one student account.
///
/// Locks are taken teacher first, then student, and held until the
/// transaction commits or is dropped. Reads see committed state only; writes
/// are staged as events and reach the journal as one batch on `commit`.
/// Dropping a `Txn` without committing discards everything staged.
pub(crate) struct Txn<'e> {
    engine: &'e Engine,
    _gate: RwLockReadGuard<'e, ()>,
    calendar: Option<OwnedRwLockWriteGuard<TeacherCalendar>>,
    account: Option<OwnedRwLockWriteGuard<StudentAccount>>,
    staged: Vec<Event>,
    started: Instant,
}

impl<'e> Txn<'e> {
    pub(super) fn new(engine: &'e Engine, gate: RwLockReadGuard<'e, ()>) -> Self {
        Self {
            engine,
            _gate: gate,
            calendar: None,
            account: None,
            staged: Vec::new(),
            started: Instant::now(),
        }
    }

    pub(super) fn engine(&self) -> &'e Engine {
        self.engine
    }

    // ── Locking ──────────────────────────────────────────────

    /// Lock an existing teacher calendar. `NotFound(teacher_id)` if the
    /// teacher has never declared anything.
    pub async fn lock_calendar(&mut self, teacher_id: Ulid) -> Result<(), EngineError> {
        let shared = self
            .engine
            .store
            .calendar(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        self.install_calendar(shared).await
    }

    pub async fn lock_calendar_or_create(&mut self, teacher_id: Ulid) -> Result<(), EngineError> {
        let shared = self.engine.store.calendar_or_create(teacher_id);
        self.install_calendar(shared).await
    }

    async fn install_calendar(&mut self, shared: super::SharedCalendar) -> Result<(), EngineError> {
        debug_assert!(self.calendar.is_none(), "one calendar per transaction");
        debug_assert!(self.account.is_none(), "calendar must be locked before account");
        self.calendar = Some(self.engine.acquire(shared, "teacher calendar").await?);
        Ok(())
    }

    /// Lock a student account if one exists. A student without an account
    /// reads as a zero balance.
    pub async fn lock_account(&mut self, student_id: Ulid) -> Result<(), EngineError> {
        if let Some(shared) = self.engine.store.account(&student_id) {
            self.account = Some(self.engine.acquire(shared, "student account").await?);
        }
        Ok(())
    }

    pub async fn lock_account_or_create(&mut self, student_id: Ulid) -> Result<(), EngineError> {
        let shared = self.engine.store.account_or_create(student_id);
        self.account = Some(self.engine.acquire(shared, "student account").await?);
        Ok(())
    }

    // ── Typed reads ──────────────────────────────────────────

    pub fn now(&self) -> NaiveDateTime {
        self.engine.now()
    }

    pub fn calendar(&self) -> Option<&TeacherCalendar> {
        self.calendar.as_deref()
    }

    pub fn account(&self) -> Option<&StudentAccount> {
        self.account.as_deref()
    }

    /// The locked teacher's policy, or the configured default.
    pub fn policy(&self) -> SchedulingPolicy {
        self.engine.policy_of(self.calendar())
    }

    pub fn credits(&self) -> u32 {
        self.account().map_or(0, |a| a.credits)
    }

    pub fn rule(&self, rule_id: &Ulid) -> Option<&AvailabilityRule> {
        self.calendar()?.availability.rule(rule_id)
    }

    pub fn exception(&self, rule_id: &Ulid, date: NaiveDate) -> Option<&AvailabilityException> {
        self.calendar()?.availability.exception(rule_id, date)
    }

    pub fn class(&self, class_id: &Ulid) -> Option<&StudentClass> {
        self.calendar()?.classes.get(class_id)
    }

    pub fn active_class_at(&self, at: NaiveDateTime) -> Option<&StudentClass> {
        self.calendar()?.classes.active_at(at)
    }

    pub fn active_classes_on(&self, date: NaiveDate) -> usize {
        self.calendar().map_or(0, |c| c.classes.active_on(date).len())
    }

    // ── Writes ───────────────────────────────────────────────

    pub(crate) fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    /// Journal the staged batch, then apply it to the locked state.
    pub async fn commit(mut self) -> Result<(), EngineError> {
        self.commit_in_place().await
    }

    /// Commit, then read from the updated state before the locks drop.
    pub async fn commit_then<R>(mut self, read: impl FnOnce(&Self) -> R) -> Result<R, EngineError> {
        self.commit_in_place().await?;
        Ok(read(&self))
    }

    async fn commit_in_place(&mut self) -> Result<(), EngineError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        self.check_scope()?;
        self.engine.journal_append(&self.staged).await?;

        let staged = std::mem::take(&mut self.staged);
        let engine = self.engine;
        let store = &engine.store;
        for event in &staged {
            if event.teacher_id().is_some()
                && let Some(cal) = self.calendar.as_deref_mut()
            {
                store.apply_to_calendar(cal, event);
            }
            if event.student_id().is_some()
                && let Some(acct) = self.account.as_deref_mut()
            {
                store.apply_to_account(acct, event);
            }
        }
        for event in &staged {
            for owner in event.teacher_id().into_iter().chain(event.student_id()) {
                engine.notify.send(owner, event);
            }
        }
        metrics::histogram!(COMMIT_DURATION_SECONDS).record(self.started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Every staged event must target state this transaction holds locked.
    fn check_scope(&self) -> Result<(), EngineError> {
        let teacher = self.calendar().map(|c| c.teacher_id);
        let student = self.account().map(|a| a.student_id);
        for event in &self.staged {
            if event.teacher_id().is_some() && event.teacher_id() != teacher {
                return Err(EngineError::TransactionAborted(
                    "event targets a calendar outside the transaction".into(),
                ));
            }
            if event.student_id().is_some() && event.student_id() != student {
                return Err(EngineError::TransactionAborted(
                    "event targets an account outside the transaction".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            tracing::debug!(discarded = self.staged.len(), "transaction rolled back");
        }
    }
}
