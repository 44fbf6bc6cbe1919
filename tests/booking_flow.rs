use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::future::join_all;
use ulid::Ulid;

use tutorcal::clock::ManualClock;
use tutorcal::config::EngineConfig;
use tutorcal::engine::{Engine, EngineError};
use tutorcal::maintenance::compact_if_due;
use tutorcal::model::*;
use tutorcal::observability;

// ── Test infrastructure ──────────────────────────────────────

fn data_dir() -> PathBuf {
    std::env::temp_dir().join(format!("tutorcal_int_test_{}", Ulid::new()))
}

fn at(m: u32, d: u32, h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, m, d)
        .unwrap()
        .and_hms_opt(h, 0, 0)
        .unwrap()
}

fn monday_mornings(teacher_id: Ulid) -> NewAvailability {
    NewAvailability {
        teacher_id,
        title: "Piano".into(),
        start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        kind: RuleKind::Regular,
        color: "#3366ff".into(),
        repeating: Some(Repeating {
            cadence: Cadence::Weekly,
            interval: 1,
            end_date: None,
        }),
    }
}

struct Harness {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    config: EngineConfig,
}

fn start(config: EngineConfig) -> Harness {
    observability::init_logging();
    let clock = Arc::new(ManualClock::new(at(1, 1, 8)));
    let engine = Arc::new(Engine::open(config.clone(), clock.clone()).unwrap());
    Harness { engine, clock, config }
}

// ── Flows ────────────────────────────────────────────────────

#[tokio::test]
async fn term_of_lessons_end_to_end() {
    let h = start(EngineConfig {
        data_dir: data_dir(),
        ..EngineConfig::default()
    });
    let teacher = Ulid::new();
    let student = Ulid::new();
    let rule = h.engine.declare_availability(monday_mornings(teacher)).await.unwrap();
    h.engine.grant_credits(student, 4, Some("starter pack".into())).await.unwrap();

    let mut teacher_events = h.engine.notify.subscribe(teacher);

    let mut booked = Vec::new();
    for day in [8, 15, 22, 29] {
        let class = h
            .engine
            .book(BookingRequest {
                student_id: student,
                teacher_id: teacher,
                rule_id: rule.id,
                scheduled_at: at(1, day, 9),
                notes: None,
            })
            .await
            .unwrap();
        booked.push(class);
    }
    assert_eq!(h.engine.credit_balance(student).await, 0);

    let first = teacher_events.recv().await.unwrap();
    assert!(first.to_payload().contains("class_booked"));

    // Teacher is away on the 15th and offers a makeup.
    h.engine
        .cancel_by_teacher(teacher, booked[1].id, "conference".into(), true)
        .await
        .unwrap();
    // Student drops the 29th well ahead of time.
    let outcome = h.engine.cancel_by_student(student, booked[3].id).await.unwrap();
    assert!(outcome.refunded);
    // The 8th happens.
    h.clock.set(at(1, 8, 10));
    h.engine
        .update_class_status(booked[0].id, ClassStatus::Completed, Some("scales".into()))
        .await
        .unwrap();

    assert_eq!(h.engine.credit_balance(student).await, 1);
    assert_eq!(h.engine.makeup_balance(student).await, 1);

    let open: Vec<NaiveDateTime> = h
        .engine
        .bookable_occurrences(
            teacher,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.start)
        .collect();
    assert_eq!(open, vec![at(1, 29, 9)]);

    // Everything above survives a restart.
    let statuses: Vec<ClassStatus> = h
        .engine
        .classes_for_student(student)
        .await
        .into_iter()
        .map(|c| c.status)
        .collect();
    drop(h.engine);
    let reopened = Engine::open(h.config.clone(), h.clock.clone()).unwrap();
    let replayed: Vec<ClassStatus> = reopened
        .classes_for_student(student)
        .await
        .into_iter()
        .map(|c| c.status)
        .collect();
    assert_eq!(replayed, statuses);
    assert_eq!(
        replayed,
        vec![
            ClassStatus::Completed,
            ClassStatus::CanceledByTeacherWithMakeup,
            ClassStatus::Scheduled,
            ClassStatus::CanceledByStudent,
        ]
    );
    assert_eq!(reopened.credit_balance(student).await, 1);
}

#[tokio::test]
async fn crowd_of_students_gets_one_seat() {
    let h = start(EngineConfig {
        data_dir: data_dir(),
        ..EngineConfig::default()
    });
    let teacher = Ulid::new();
    let rule = h.engine.declare_availability(monday_mornings(teacher)).await.unwrap();

    let students: Vec<Ulid> = (0..32).map(|_| Ulid::new()).collect();
    for s in &students {
        h.engine.grant_credits(*s, 1, None).await.unwrap();
    }

    let attempts = students.iter().map(|s| {
        let engine = h.engine.clone();
        let req = BookingRequest {
            student_id: *s,
            teacher_id: teacher,
            rule_id: rule.id,
            scheduled_at: at(1, 8, 9),
            notes: None,
        };
        async move { engine.book(req).await }
    });
    let results = join_all(attempts).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::SlotAlreadyBooked { .. }))
    );

    let mut remaining = 0;
    for s in &students {
        remaining += h.engine.credit_balance(*s).await;
    }
    assert_eq!(remaining, students.len() as u32 - 1);
}

#[tokio::test]
async fn compactor_pass_keeps_state() {
    let h = start(EngineConfig {
        data_dir: data_dir(),
        compact_threshold: 5,
        ..EngineConfig::default()
    });
    let student = Ulid::new();
    for _ in 0..6 {
        h.engine.grant_credits(student, 2, None).await.unwrap();
    }
    assert!(compact_if_due(&h.engine, h.config.compact_threshold).await.unwrap());
    assert!(!compact_if_due(&h.engine, h.config.compact_threshold).await.unwrap());

    drop(h.engine);
    let reopened = Engine::open(h.config.clone(), h.clock.clone()).unwrap();
    assert_eq!(reopened.credit_balance(student).await, 12);
    assert_eq!(reopened.credit_ledger(student).await.len(), 6);
}
