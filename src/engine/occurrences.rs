use std::collections::HashSet;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

// ── Occurrence expansion ──────────────────────────────────────────

/// One concrete instance of an availability rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Occurrence {
    pub rule_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Occurrence {
    pub fn of(rule: &AvailabilityRule, date: NaiveDate) -> Self {
        Self {
            rule_id: rule.id,
            date,
            start: date.and_time(rule.start_time),
            end: date.and_time(rule.end_time),
        }
    }
}

/// Expand `rule` into its occurrences within `[window_start, window_end]`
/// (inclusive), dropping any date that carries an exception for this rule.
///
/// Pure: identical inputs always give identical, date-ordered output.
pub fn expand<'a, I>(
    rule: &AvailabilityRule,
    exceptions: I,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Vec<Occurrence>
where
    I: IntoIterator<Item = &'a AvailabilityException>,
{
    let excluded: HashSet<NaiveDate> = exceptions
        .into_iter()
        .filter(|e| e.rule_id == rule.id)
        .map(|e| e.occurrence_date)
        .collect();
    occurrence_dates(rule, window_start, window_end)
        .into_iter()
        .filter(|d| !excluded.contains(d))
        .map(|d| Occurrence::of(rule, d))
        .collect()
}

/// Expand several rules at once, ordered by start time then rule id.
pub fn expand_all<'a, R, I>(
    rules: R,
    exceptions: I,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Vec<Occurrence>
where
    R: IntoIterator<Item = &'a AvailabilityRule>,
    I: IntoIterator<Item = &'a AvailabilityException>,
{
    let excluded: HashSet<(Ulid, NaiveDate)> = exceptions
        .into_iter()
        .map(|e| (e.rule_id, e.occurrence_date))
        .collect();
    let mut out: Vec<Occurrence> = rules
        .into_iter()
        .flat_map(|rule| {
            occurrence_dates(rule, window_start, window_end)
                .into_iter()
                .filter(|d| !excluded.contains(&(rule.id, *d)))
                .map(|d| Occurrence::of(rule, d))
                .collect::<Vec<_>>()
        })
        .collect();
    out.sort_by_key(|o| (o.start, o.rule_id));
    out
}

/// Dates generated by the rule within the window, exceptions ignored.
pub fn occurrence_dates(
    rule: &AvailabilityRule,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Vec<NaiveDate> {
    let first = window_start.max(rule.start_date);
    let last = match rule.last_date() {
        Some(end) => window_end.min(end),
        None => window_end,
    };
    if first > last {
        return Vec::new();
    }

    let Some(rep) = rule.repeating else {
        // first <= last already pins start_date inside the window
        return vec![rule.start_date];
    };
    let interval = rep.interval.max(1);

    let mut out = Vec::new();
    match rep.cadence.step_days(interval) {
        Some(step) => {
            // Jump to the first step at or after `first`.
            let offset = (first - rule.start_date).num_days();
            let k = (offset + step - 1) / step;
            let mut cursor = rule.start_date.checked_add_days(Days::new((k * step) as u64));
            while let Some(d) = cursor {
                if d > last {
                    break;
                }
                out.push(d);
                cursor = d.checked_add_days(Days::new(step as u64));
            }
        }
        None => {
            let anchor = month_index(rule.start_date);
            let behind = month_index(first) - anchor;
            let step = interval as i64;
            let mut idx = anchor + (behind + step - 1) / step * step;
            loop {
                let (year, month) = split_month_index(idx);
                match NaiveDate::from_ymd_opt(year, month, 1) {
                    Some(month_start) if month_start <= last => {}
                    _ => break,
                }
                // Months without the anchor's day are skipped, never clamped.
                if let Some(d) = NaiveDate::from_ymd_opt(year, month, rule.start_date.day())
                    && d >= first
                    && d <= last
                {
                    out.push(d);
                }
                idx += step;
            }
        }
    }
    out
}

/// Whether the rule generates an occurrence on `date`, exceptions ignored.
pub fn is_occurrence(rule: &AvailabilityRule, date: NaiveDate) -> bool {
    if date < rule.start_date {
        return false;
    }
    if let Some(last) = rule.last_date()
        && date > last
    {
        return false;
    }
    let Some(rep) = rule.repeating else {
        return date == rule.start_date;
    };
    let interval = rep.interval.max(1);
    match rep.cadence.step_days(interval) {
        Some(step) => (date - rule.start_date).num_days() % step == 0,
        None => {
            date.day() == rule.start_date.day()
                && (month_index(date) - month_index(rule.start_date)) % interval as i64 == 0
        }
    }
}

fn month_index(d: NaiveDate) -> i64 {
    d.year() as i64 * 12 + d.month0() as i64
}

fn split_month_index(idx: i64) -> (i32, u32) {
    ((idx.div_euclid(12)) as i32, (idx.rem_euclid(12) + 1) as u32)
}
