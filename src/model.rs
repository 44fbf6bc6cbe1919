use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// How a repeating availability rule steps from its anchor date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Weekly,
    Biweekly,
    Monthly,
}

impl Cadence {
    /// Day step for day-based cadences. `None` for monthly.
    pub fn step_days(self, interval: u32) -> Option<i64> {
        match self {
            Cadence::Weekly => Some(7 * interval as i64),
            Cadence::Biweekly => Some(14 * interval as i64),
            Cadence::Monthly => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repeating {
    pub cadence: Cadence,
    /// Multiplier on the cadence step. Always >= 1.
    pub interval: u32,
    /// Last date (inclusive) that may produce an occurrence.
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Regular,
    Occasional,
    Makeup,
}

/// A teacher's declared availability block. Rules are never mutated by
/// per-occurrence changes; those live in [`AvailabilityException`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub title: String,
    /// Anchor date. The only occurrence when `repeating` is `None`.
    pub start_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub kind: RuleKind,
    pub color: String,
    pub repeating: Option<Repeating>,
}

impl AvailabilityRule {
    pub fn duration_minutes(&self) -> u32 {
        (self.end_time - self.start_time).num_minutes().max(0) as u32
    }

    /// Last date that may produce an occurrence, if bounded.
    pub fn last_date(&self) -> Option<NaiveDate> {
        match &self.repeating {
            None => Some(self.start_date),
            Some(r) => r.end_date,
        }
    }

    pub fn cadence(&self) -> Option<Cadence> {
        self.repeating.map(|r| r.cadence)
    }
}

/// Input for declaring or editing a rule; the engine assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAvailability {
    pub teacher_id: Ulid,
    pub title: String,
    pub start_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub kind: RuleKind,
    pub color: String,
    pub repeating: Option<Repeating>,
}

impl NewAvailability {
    pub fn into_rule(self, id: Ulid) -> AvailabilityRule {
        AvailabilityRule {
            id,
            teacher_id: self.teacher_id,
            title: self.title,
            start_date: self.start_date,
            start_time: self.start_time,
            end_time: self.end_time,
            kind: self.kind,
            color: self.color,
            repeating: self.repeating,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    Cancelled,
    ConsumedByBooking,
}

/// Per-occurrence override. At most one per `(rule_id, occurrence_date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityException {
    pub id: Ulid,
    pub rule_id: Ulid,
    pub teacher_id: Ulid,
    pub occurrence_date: NaiveDate,
    pub kind: ExceptionKind,
    pub class_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteType {
    /// Cancel one occurrence; the rule is untouched.
    Single,
    /// Cancel this occurrence and every later one.
    Future,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassStatus {
    Scheduled,
    Completed,
    CanceledByStudent,
    CanceledByTeacher,
    CanceledByTeacherWithMakeup,
    CanceledForCredit,
    NoShow,
    Rescheduled,
    TeacherVacation,
    Overdue,
}

impl ClassStatus {
    /// Active classes occupy their `(teacher_id, scheduled_at)` slot.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            ClassStatus::CanceledByStudent
                | ClassStatus::CanceledByTeacher
                | ClassStatus::CanceledByTeacherWithMakeup
                | ClassStatus::CanceledForCredit
                | ClassStatus::Rescheduled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClassStatus::Scheduled => "scheduled",
            ClassStatus::Completed => "completed",
            ClassStatus::CanceledByStudent => "canceled-by-student",
            ClassStatus::CanceledByTeacher => "canceled-by-teacher",
            ClassStatus::CanceledByTeacherWithMakeup => "canceled-by-teacher-with-makeup",
            ClassStatus::CanceledForCredit => "canceled-for-credit",
            ClassStatus::NoShow => "no-show",
            ClassStatus::Rescheduled => "rescheduled",
            ClassStatus::TeacherVacation => "teacher-vacation",
            ClassStatus::Overdue => "overdue",
        }
    }
}

impl fmt::Display for ClassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed booking. Never deleted; cancellation is a status write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentClass {
    pub id: Ulid,
    pub student_id: Ulid,
    pub teacher_id: Ulid,
    pub rule_id: Option<Ulid>,
    pub scheduled_at: NaiveDateTime,
    pub duration_minutes: u32,
    pub status: ClassStatus,
    pub notes: Option<String>,
    pub feedback: Option<String>,
    pub cancellation_reason: Option<String>,
    /// Back-reference to the class this one replaced.
    pub rescheduled_from: Option<Ulid>,
    pub created_by: Ulid,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Per-teacher booking thresholds. Zero disables the horizon and the daily cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingPolicy {
    pub booking_lead_time_hours: u32,
    pub cancellation_policy_hours: u32,
    pub booking_horizon_days: u32,
    pub max_occasional_classes_per_day: u32,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            booking_lead_time_hours: 2,
            cancellation_policy_hours: 24,
            booking_horizon_days: 60,
            max_occasional_classes_per_day: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    Grant,
    Booking,
    Refund,
    TeacherCancellation,
    /// Counts toward the makeup allowance, not the spendable balance.
    MakeupEntitlement,
}

/// One line of a student's append-only credit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditEntry {
    pub at: NaiveDateTime,
    pub delta: i64,
    pub reason: CreditReason,
    pub class_id: Option<Ulid>,
    pub note: Option<String>,
}

/// The journal record format. A committed transaction is one batch of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    PolicySet {
        teacher_id: Ulid,
        policy: SchedulingPolicy,
    },
    RuleDeclared {
        rule: AvailabilityRule,
    },
    RuleUpdated {
        rule: AvailabilityRule,
    },
    RuleDeleted {
        teacher_id: Ulid,
        rule_id: Ulid,
    },
    ExceptionAdded {
        exception: AvailabilityException,
    },
    ExceptionRemoved {
        teacher_id: Ulid,
        rule_id: Ulid,
        date: NaiveDate,
    },
    ClassBooked {
        class: StudentClass,
    },
    ClassStatusChanged {
        teacher_id: Ulid,
        class_id: Ulid,
        status: ClassStatus,
        feedback: Option<String>,
        reason: Option<String>,
        at: NaiveDateTime,
    },
    CreditsAdjusted {
        student_id: Ulid,
        entry: CreditEntry,
    },
}

impl Event {
    /// Teacher calendar this event mutates, if any.
    pub fn teacher_id(&self) -> Option<Ulid> {
        match self {
            Event::PolicySet { teacher_id, .. }
            | Event::RuleDeleted { teacher_id, .. }
            | Event::ExceptionRemoved { teacher_id, .. }
            | Event::ClassStatusChanged { teacher_id, .. } => Some(*teacher_id),
            Event::RuleDeclared { rule } | Event::RuleUpdated { rule } => Some(rule.teacher_id),
            Event::ExceptionAdded { exception } => Some(exception.teacher_id),
            Event::ClassBooked { class } => Some(class.teacher_id),
            Event::CreditsAdjusted { .. } => None,
        }
    }

    /// Student account this event mutates, if any.
    pub fn student_id(&self) -> Option<Ulid> {
        match self {
            Event::CreditsAdjusted { student_id, .. } => Some(*student_id),
            _ => None,
        }
    }

    /// JSON form handed to external subscribers (notification delivery etc).
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Request / result types ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub student_id: Ulid,
    pub teacher_id: Ulid,
    pub rule_id: Ulid,
    pub scheduled_at: NaiveDateTime,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationOutcome {
    pub class: StudentClass,
    pub refunded: bool,
    pub message: String,
}

/// Raw calendar data for a presentation layer to expand and render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CalendarSnapshot {
    pub rules: Vec<AvailabilityRule>,
    pub exceptions: Vec<AvailabilityException>,
    pub booked_classes: Vec<StudentClass>,
}
