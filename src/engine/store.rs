use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::calendar::{StudentAccount, TeacherCalendar};
use crate::model::*;

pub type SharedCalendar = Arc<RwLock<TeacherCalendar>>;
pub type SharedAccount = Arc<RwLock<StudentAccount>>;

/// Per-teacher calendars and per-student accounts, each behind its own lock,
/// plus the reverse indexes needed to route an id to its owner.
pub struct Store {
    calendars: DashMap<Ulid, SharedCalendar>,
    accounts: DashMap<Ulid, SharedAccount>,
    /// rule id → teacher id
    rule_owner: DashMap<Ulid, Ulid>,
    /// class id → teacher id
    class_owner: DashMap<Ulid, Ulid>,
    /// student id → class ids, in booking order
    student_classes: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            accounts: DashMap::new(),
            rule_owner: DashMap::new(),
            class_owner: DashMap::new(),
            student_classes: DashMap::new(),
        }
    }

    /// Rebuild from committed batches. Nothing else can hold these locks yet,
    /// so the state is assembled unlocked and wrapped at the end.
    pub fn from_history(history: &[Vec<Event>]) -> Self {
        let store = Self::new();
        let mut calendars: HashMap<Ulid, TeacherCalendar> = HashMap::new();
        let mut accounts: HashMap<Ulid, StudentAccount> = HashMap::new();

        for event in history.iter().flatten() {
            if let Some(teacher_id) = event.teacher_id() {
                let cal = calendars
                    .entry(teacher_id)
                    .or_insert_with(|| TeacherCalendar::new(teacher_id));
                store.apply_to_calendar(cal, event);
            }
            if let Some(student_id) = event.student_id() {
                let acct = accounts
                    .entry(student_id)
                    .or_insert_with(|| StudentAccount::new(student_id));
                store.apply_to_account(acct, event);
            }
        }

        for (id, cal) in calendars {
            store.calendars.insert(id, Arc::new(RwLock::new(cal)));
        }
        for (id, acct) in accounts {
            store.accounts.insert(id, Arc::new(RwLock::new(acct)));
        }
        store
    }

    // ── Lookup ───────────────────────────────────────────────

    pub fn calendar(&self, teacher_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(teacher_id).map(|e| e.value().clone())
    }

    pub fn calendar_or_create(&self, teacher_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(teacher_id)
            .or_insert_with(|| Arc::new(RwLock::new(TeacherCalendar::new(teacher_id))))
            .value()
            .clone()
    }

    pub fn account(&self, student_id: &Ulid) -> Option<SharedAccount> {
        self.accounts.get(student_id).map(|e| e.value().clone())
    }

    pub fn account_or_create(&self, student_id: Ulid) -> SharedAccount {
        self.accounts
            .entry(student_id)
            .or_insert_with(|| Arc::new(RwLock::new(StudentAccount::new(student_id))))
            .value()
            .clone()
    }

    pub fn teacher_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.calendars.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn student_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.accounts.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Reverse indexes ──────────────────────────────────────

    pub fn owner_of_rule(&self, rule_id: &Ulid) -> Option<Ulid> {
        self.rule_owner.get(rule_id).map(|e| *e.value())
    }

    pub fn owner_of_class(&self, class_id: &Ulid) -> Option<Ulid> {
        self.class_owner.get(class_id).map(|e| *e.value())
    }

    pub fn classes_of_student(&self, student_id: &Ulid) -> Vec<Ulid> {
        self.student_classes
            .get(student_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event to a calendar. Caller holds the write lock.
    pub fn apply_to_calendar(&self, cal: &mut TeacherCalendar, event: &Event) {
        match event {
            Event::PolicySet { policy, .. } => cal.policy = Some(*policy),
            Event::RuleDeclared { rule } | Event::RuleUpdated { rule } => {
                self.rule_owner.insert(rule.id, rule.teacher_id);
                cal.availability.upsert_rule(rule.clone());
            }
            Event::RuleDeleted { rule_id, .. } => {
                cal.availability.remove_rule(rule_id);
                self.rule_owner.remove(rule_id);
            }
            Event::ExceptionAdded { exception } => {
                cal.availability.insert_exception(exception.clone());
            }
            Event::ExceptionRemoved { rule_id, date, .. } => {
                cal.availability.remove_exception(rule_id, *date);
            }
            Event::ClassBooked { class } => {
                self.class_owner.insert(class.id, class.teacher_id);
                let mut ids = self.student_classes.entry(class.student_id).or_default();
                if !ids.contains(&class.id) {
                    ids.push(class.id);
                }
                drop(ids);
                cal.classes.insert(class.clone());
            }
            Event::ClassStatusChanged {
                class_id,
                status,
                feedback,
                reason,
                at,
                ..
            } => {
                cal.classes
                    .set_status(class_id, *status, feedback.clone(), reason.clone(), *at);
            }
            Event::CreditsAdjusted { .. } => {}
        }
    }

    /// Apply a committed event to a student account. Caller holds the write lock.
    pub fn apply_to_account(&self, acct: &mut StudentAccount, event: &Event) {
        if let Event::CreditsAdjusted { entry, .. } = event {
            acct.record(entry.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn rule(teacher_id: Ulid) -> AvailabilityRule {
        AvailabilityRule {
            id: Ulid::new(),
            teacher_id,
            title: "Violin".into(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            kind: RuleKind::Regular,
            color: "green".into(),
            repeating: None,
        }
    }

    #[test]
    fn history_rebuilds_state_and_indexes() {
        let teacher = Ulid::new();
        let student = Ulid::new();
        let r = rule(teacher);
        let at = r.start_date.and_time(r.start_time);
        let class = StudentClass {
            id: Ulid::new(),
            student_id: student,
            teacher_id: teacher,
            rule_id: Some(r.id),
            scheduled_at: at,
            duration_minutes: 60,
            status: ClassStatus::Scheduled,
            notes: None,
            feedback: None,
            cancellation_reason: None,
            rescheduled_from: None,
            created_by: student,
            created_at: at,
            updated_at: at,
        };
        let grant = CreditEntry {
            at,
            delta: 2,
            reason: CreditReason::Grant,
            class_id: None,
            note: None,
        };
        let history = vec![
            vec![Event::RuleDeclared { rule: r.clone() }],
            vec![Event::CreditsAdjusted {
                student_id: student,
                entry: grant,
            }],
            vec![Event::ClassBooked { class: class.clone() }],
        ];

        let store = Store::from_history(&history);
        assert_eq!(store.owner_of_rule(&r.id), Some(teacher));
        assert_eq!(store.owner_of_class(&class.id), Some(teacher));
        assert_eq!(store.classes_of_student(&student), vec![class.id]);
        assert_eq!(store.teacher_ids(), vec![teacher]);

        let cal = store.calendar(&teacher).unwrap();
        let cal = cal.try_read().unwrap();
        assert!(cal.classes.active_at(at).is_some());
        let acct = store.account(&student).unwrap();
        assert_eq!(acct.try_read().unwrap().credits, 2);
    }

    #[test]
    fn deleting_rule_clears_owner_index() {
        let teacher = Ulid::new();
        let r = rule(teacher);
        let history = vec![
            vec![Event::RuleDeclared { rule: r.clone() }],
            vec![Event::RuleDeleted {
                teacher_id: teacher,
                rule_id: r.id,
            }],
        ];
        let store = Store::from_history(&history);
        assert_eq!(store.owner_of_rule(&r.id), None);
        assert_eq!(store.calendar(&teacher).unwrap().try_read().unwrap().availability.rule_count(), 0);
    }
}
