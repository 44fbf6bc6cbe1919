mod accounts;
mod booking;
mod cancellation;
mod conflict;
mod error;
mod journal;
mod occurrences;
mod policy;
mod queries;
mod rules;
mod store;
mod txn;

pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;
pub use journal::{Journal, MemoryJournal, WalJournal};
pub use occurrences::{Occurrence, expand, expand_all, is_occurrence, occurrence_dates};
pub use policy::refund_eligible;
pub use store::{SharedAccount, SharedCalendar, Store};
pub(crate) use txn::Txn;

use std::io;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};

use crate::calendar::TeacherCalendar;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{COMMITS_ABORTED_TOTAL, WAL_COMPACTIONS_TOTAL};

/// The scheduling and booking core.
///
/// State lives in a [`Store`] of per-teacher calendars and per-student
/// accounts. Every mutation runs as a `Txn` that journals its events as one
/// batch before applying them, so a crash can never expose half a booking.
pub struct Engine {
    store: Store,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
    pub notify: Arc<NotifyHub>,
    config: EngineConfig,
    /// Held shared by transactions, exclusively by compaction.
    gate: RwLock<()>,
}

impl Engine {
    /// Open the file-backed engine under `config.data_dir`, replaying the WAL.
    /// Spawns the WAL writer, so it must run inside a tokio runtime.
    pub fn open(config: EngineConfig, clock: Arc<dyn Clock>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let (journal, history) = WalJournal::open(&config.wal_path())?;
        info!(
            wal = %config.wal_path().display(),
            batches = history.len(),
            "replayed journal"
        );
        Ok(Self::with_journal(Arc::new(journal), &history, clock, config))
    }

    /// Build over any journal, rebuilding state from `history`.
    pub fn with_journal(
        journal: Arc<dyn Journal>,
        history: &[Vec<Event>],
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store: Store::from_history(history),
            journal,
            clock,
            notify: Arc::new(NotifyHub::new()),
            config,
            gate: RwLock::new(()),
        }
    }

    /// Engine backed by a fresh [`MemoryJournal`].
    pub fn in_memory(clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self::with_journal(Arc::new(MemoryJournal::new()), &[], clock, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub(crate) fn policy_of(&self, calendar: Option<&TeacherCalendar>) -> SchedulingPolicy {
        calendar
            .and_then(|c| c.policy)
            .unwrap_or(self.config.default_policy)
    }

    // ── Transactions ─────────────────────────────────────────

    /// Start a unit of work. Waits behind a running compaction, bounded by
    /// `lock_timeout`.
    pub(crate) async fn begin(&self) -> Result<Txn<'_>, EngineError> {
        let gate = tokio::time::timeout(self.config.lock_timeout, self.gate.read())
            .await
            .map_err(|_| self.aborted("timed out waiting for compaction".into()))?;
        Ok(Txn::new(self, gate))
    }

    pub(crate) async fn acquire<T>(
        &self,
        lock: Arc<RwLock<T>>,
        what: &str,
    ) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
        tokio::time::timeout(self.config.lock_timeout, lock.write_owned())
            .await
            .map_err(|_| self.aborted(format!("timed out waiting for {what} lock")))
    }

    /// Append one transaction's batch, retrying with linear backoff.
    pub(crate) async fn journal_append(&self, batch: &[Event]) -> Result<(), EngineError> {
        let attempts = self.config.commit_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.journal.append(batch).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "journal append failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.commit_backoff * attempt).await;
                    }
                }
            }
        }
        Err(self.aborted(format!("journal unavailable: {last_error}")))
    }

    fn aborted(&self, reason: String) -> EngineError {
        metrics::counter!(COMMITS_ABORTED_TOTAL).increment(1);
        warn!(%reason, "transaction aborted");
        EngineError::TransactionAborted(reason)
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the journal as the minimal event set that recreates current
    /// state. New transactions wait until it finishes.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;
        let snapshot = self.snapshot_events().await;
        let len = snapshot.len();
        self.journal
            .compact(snapshot)
            .await
            .map_err(|e| EngineError::Journal(e.to_string()))?;
        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = len, "compacted journal");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for teacher_id in self.store.teacher_ids() {
            let Some(shared) = self.store.calendar(&teacher_id) else { continue };
            let cal = shared.read().await;
            if let Some(policy) = cal.policy {
                events.push(Event::PolicySet { teacher_id, policy });
            }
            for rule in cal.availability.rules() {
                events.push(Event::RuleDeclared { rule: rule.clone() });
            }
            for exception in cal.availability.exceptions() {
                events.push(Event::ExceptionAdded {
                    exception: exception.clone(),
                });
            }
            let mut classes: Vec<&StudentClass> = cal.classes.all().collect();
            classes.sort_by_key(|c| c.id);
            for class in classes {
                events.push(Event::ClassBooked { class: class.clone() });
            }
        }
        for student_id in self.store.student_ids() {
            let Some(shared) = self.store.account(&student_id) else { continue };
            let acct = shared.read().await;
            for entry in &acct.ledger {
                events.push(Event::CreditsAdjusted {
                    student_id,
                    entry: entry.clone(),
                });
            }
        }
        events
    }
}
