use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::occurrences::{Occurrence, expand_all};
use super::policy::check_booking_window;
use super::{Engine, EngineError};

impl Engine {
    /// Raw calendar data for `[window_start, window_end]`: the rules that can
    /// produce occurrences there, the exceptions dated inside it, and the
    /// active classes starting inside it.
    pub async fn list_occurrences(
        &self,
        teacher_id: Ulid,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<CalendarSnapshot, EngineError> {
        check_window(window_start, window_end)?;
        let Some(shared) = self.store.calendar(&teacher_id) else {
            return Ok(CalendarSnapshot::default());
        };
        let cal = shared.read().await;

        let rules = cal
            .availability
            .rules()
            .filter(|r| r.start_date <= window_end && r.last_date().is_none_or(|last| last >= window_start))
            .cloned()
            .collect();
        let exceptions = cal
            .availability
            .exceptions_between(window_start, window_end)
            .cloned()
            .collect();
        let booked_classes = cal
            .classes
            .between(window_start, window_end)
            .into_iter()
            .filter(|c| c.status.is_active())
            .cloned()
            .collect();

        Ok(CalendarSnapshot {
            rules,
            exceptions,
            booked_classes,
        })
    }

    /// Occurrences a student could book right now: expanded, minus exceptions,
    /// minus slots already taken, limited by the teacher's lead time and horizon.
    pub async fn bookable_occurrences(
        &self,
        teacher_id: Ulid,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<Vec<Occurrence>, EngineError> {
        check_window(window_start, window_end)?;
        let Some(shared) = self.store.calendar(&teacher_id) else {
            return Ok(Vec::new());
        };
        let cal = shared.read().await;
        let policy = self.policy_of(Some(&*cal));
        let now = self.now();

        let mut occurrences = expand_all(
            cal.availability.rules(),
            cal.availability.exceptions_between(window_start, window_end),
            window_start,
            window_end,
        );
        occurrences.retain(|o| {
            cal.classes.active_at(o.start).is_none()
                && check_booking_window(&policy, o.start, now).is_ok()
        });
        Ok(occurrences)
    }

    pub async fn availability_rules(&self, teacher_id: Ulid) -> Vec<AvailabilityRule> {
        match self.store.calendar(&teacher_id) {
            Some(shared) => shared.read().await.availability.rules().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Rules with an occurrence on `date`, before exceptions are applied.
    pub async fn rules_on(&self, teacher_id: Ulid, date: NaiveDate) -> Vec<AvailabilityRule> {
        let Some(shared) = self.store.calendar(&teacher_id) else {
            return Vec::new();
        };
        let cal = shared.read().await;
        let mut rules: Vec<AvailabilityRule> = cal.availability.rules_on(date).into_iter().cloned().collect();
        rules.sort_by_key(|r| (r.start_time, r.id));
        rules
    }

    pub async fn get_class(&self, class_id: Ulid) -> Result<StudentClass, EngineError> {
        let teacher_id = self
            .store
            .owner_of_class(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let shared = self
            .store
            .calendar(&teacher_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let cal = shared.read().await;
        cal.classes.get(&class_id).cloned().ok_or(EngineError::NotFound(class_id))
    }

    /// Every class a student has booked, any status, in start order.
    pub async fn classes_for_student(&self, student_id: Ulid) -> Vec<StudentClass> {
        let mut by_teacher: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for class_id in self.store.classes_of_student(&student_id) {
            if let Some(teacher_id) = self.store.owner_of_class(&class_id) {
                by_teacher.entry(teacher_id).or_default().push(class_id);
            }
        }

        let mut classes = Vec::new();
        for (teacher_id, ids) in by_teacher {
            let Some(shared) = self.store.calendar(&teacher_id) else { continue };
            let cal = shared.read().await;
            classes.extend(ids.iter().filter_map(|id| cal.classes.get(id)).cloned());
        }
        classes.sort_by_key(|c| (c.scheduled_at, c.id));
        classes
    }

    /// Every class booked with a teacher, any status, in start order.
    pub async fn classes_for_teacher(&self, teacher_id: Ulid) -> Vec<StudentClass> {
        let Some(shared) = self.store.calendar(&teacher_id) else {
            return Vec::new();
        };
        let cal = shared.read().await;
        let mut classes: Vec<StudentClass> = cal.classes.all().cloned().collect();
        classes.sort_by_key(|c| (c.scheduled_at, c.id));
        classes
    }
}

fn check_window(start: NaiveDate, end: NaiveDate) -> Result<(), EngineError> {
    if end < start {
        return Err(EngineError::Invalid("window end precedes window start"));
    }
    if (end - start).num_days() > MAX_EXPANSION_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("expansion window too wide"));
    }
    Ok(())
}
