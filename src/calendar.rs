use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::engine::is_occurrence;
use crate::model::*;

/// Rules and their per-occurrence exceptions for one teacher.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityStore {
    rules: BTreeMap<Ulid, AvailabilityRule>,
    /// Keyed by `(rule_id, occurrence_date)`; the key enforces one exception per occurrence.
    exceptions: BTreeMap<(Ulid, NaiveDate), AvailabilityException>,
}

impl AvailabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(&self, id: &Ulid) -> Option<&AvailabilityRule> {
        self.rules.get(id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &AvailabilityRule> {
        self.rules.values()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Rules that generate an occurrence on `date`, ignoring exceptions.
    pub fn rules_on(&self, date: NaiveDate) -> Vec<&AvailabilityRule> {
        self.rules
            .values()
            .filter(|r| is_occurrence(r, date))
            .collect()
    }

    /// Insert or replace a rule.
    pub fn upsert_rule(&mut self, rule: AvailabilityRule) {
        self.rules.insert(rule.id, rule);
    }

    /// Remove a rule together with all of its exceptions.
    pub fn remove_rule(&mut self, id: &Ulid) -> Option<AvailabilityRule> {
        let removed = self.rules.remove(id)?;
        let keys: Vec<_> = self
            .exceptions
            .range((*id, NaiveDate::MIN)..=(*id, NaiveDate::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.exceptions.remove(&key);
        }
        Some(removed)
    }

    pub fn exception(&self, rule_id: &Ulid, date: NaiveDate) -> Option<&AvailabilityException> {
        self.exceptions.get(&(*rule_id, date))
    }

    pub fn exceptions(&self) -> impl Iterator<Item = &AvailabilityException> {
        self.exceptions.values()
    }

    pub fn exceptions_for(&self, rule_id: &Ulid) -> impl Iterator<Item = &AvailabilityException> {
        self.exceptions
            .range((*rule_id, NaiveDate::MIN)..=(*rule_id, NaiveDate::MAX))
            .map(|(_, e)| e)
    }

    /// Exceptions whose occurrence date lies in `[start, end]`.
    pub fn exceptions_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Iterator<Item = &AvailabilityException> {
        self.exceptions
            .values()
            .filter(move |e| e.occurrence_date >= start && e.occurrence_date <= end)
    }

    pub fn insert_exception(&mut self, exception: AvailabilityException) {
        self.exceptions
            .insert((exception.rule_id, exception.occurrence_date), exception);
    }

    pub fn remove_exception(&mut self, rule_id: &Ulid, date: NaiveDate) -> Option<AvailabilityException> {
        self.exceptions.remove(&(*rule_id, date))
    }
}

/// Booked classes for one teacher, with an index of the active ones by start time.
#[derive(Debug, Clone, Default)]
pub struct ClassStore {
    classes: HashMap<Ulid, StudentClass>,
    /// At most one active class per start time.
    active: BTreeMap<NaiveDateTime, Ulid>,
}

impl ClassStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Ulid) -> Option<&StudentClass> {
        self.classes.get(id)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &StudentClass> {
        self.classes.values()
    }

    pub fn active_at(&self, at: NaiveDateTime) -> Option<&StudentClass> {
        self.active.get(&at).and_then(|id| self.classes.get(id))
    }

    /// Active classes starting on `date`, in start order.
    pub fn active_on(&self, date: NaiveDate) -> Vec<&StudentClass> {
        let from = date.and_time(NaiveTime::MIN);
        let ids: Vec<&Ulid> = match date.succ_opt() {
            Some(next) => self
                .active
                .range(from..next.and_time(NaiveTime::MIN))
                .map(|(_, id)| id)
                .collect(),
            None => self.active.range(from..).map(|(_, id)| id).collect(),
        };
        ids.into_iter().filter_map(|id| self.classes.get(id)).collect()
    }

    /// Every class (any status) starting within `[start, end]`, in start order.
    pub fn between(&self, start: NaiveDate, end: NaiveDate) -> Vec<&StudentClass> {
        let mut hits: Vec<&StudentClass> = self
            .classes
            .values()
            .filter(|c| {
                let d = c.scheduled_at.date();
                d >= start && d <= end
            })
            .collect();
        hits.sort_by_key(|c| (c.scheduled_at, c.id));
        hits
    }

    pub fn insert(&mut self, class: StudentClass) {
        if class.status.is_active() {
            self.active.insert(class.scheduled_at, class.id);
        }
        self.classes.insert(class.id, class);
    }

    /// Apply a status write, keeping the active index in step.
    pub fn set_status(
        &mut self,
        id: &Ulid,
        status: ClassStatus,
        feedback: Option<String>,
        reason: Option<String>,
        at: NaiveDateTime,
    ) -> Option<&StudentClass> {
        let class = self.classes.get_mut(id)?;
        class.status = status;
        if feedback.is_some() {
            class.feedback = feedback;
        }
        if reason.is_some() {
            class.cancellation_reason = reason;
        }
        class.updated_at = at;

        if status.is_active() {
            self.active.entry(class.scheduled_at).or_insert(class.id);
        } else if self.active.get(&class.scheduled_at) == Some(&class.id) {
            self.active.remove(&class.scheduled_at);
        }
        self.classes.get(id)
    }
}

/// Everything owned by one teacher. Locked as a unit by booking transactions.
#[derive(Debug, Clone)]
pub struct TeacherCalendar {
    pub teacher_id: Ulid,
    pub policy: Option<SchedulingPolicy>,
    pub availability: AvailabilityStore,
    pub classes: ClassStore,
}

impl TeacherCalendar {
    pub fn new(teacher_id: Ulid) -> Self {
        Self {
            teacher_id,
            policy: None,
            availability: AvailabilityStore::new(),
            classes: ClassStore::new(),
        }
    }
}

/// A student's credit balance, makeup allowance, and the ledger behind both.
#[derive(Debug, Clone)]
pub struct StudentAccount {
    pub student_id: Ulid,
    pub credits: u32,
    pub makeup_credits: u32,
    pub ledger: Vec<CreditEntry>,
}

impl StudentAccount {
    pub fn new(student_id: Ulid) -> Self {
        Self {
            student_id,
            credits: 0,
            makeup_credits: 0,
            ledger: Vec::new(),
        }
    }

    pub fn record(&mut self, entry: CreditEntry) {
        let target = match entry.reason {
            CreditReason::MakeupEntitlement => &mut self.makeup_credits,
            _ => &mut self.credits,
        };
        *target = (*target as i64 + entry.delta).clamp(0, u32::MAX as i64) as u32;
        self.ledger.push(entry);
    }
}
