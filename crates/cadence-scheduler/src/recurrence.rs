//! Recurrence expansion: turns a schedule into concrete UTC occurrence windows.
//!
//! Supported subset: Daily / Weekly (optional weekday list) / Monthly,
//! interval, count, until. Every generated wall-clock instant is converted
//! to UTC on its own, so "09:00 local" stays 09:00 across DST changes.
//!
//! Local times that fall into a DST gap are pushed forward by the gap;
//! ambiguous local times (DST fold) resolve to the earlier instant.

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{Frequency, Schedule, ScheduleType, TimeWindow};
use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;

/// Guard against rules that can never produce a valid date (e.g. Feb 30).
const MAX_SKIPPED_PERIODS: u32 = 1_000;

/// One generated occurrence: `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OccurrenceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Resolve an IANA time zone id.
pub fn parse_timezone(id: &str) -> Result<Tz> {
    id.parse::<Tz>()
        .map_err(|e| CadenceError::Validation(format!("Unknown time zone '{id}': {e}")))
}

/// Convert a wall-clock time in `tz` to UTC.
pub fn to_utc(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // Gap: apply the offset in force just before the transition.
            let before_gap = local - Duration::hours(3);
            let offset_secs = tz
                .from_local_datetime(&before_gap)
                .earliest()
                .map(|dt| dt.offset().fix().local_minus_utc())
                .unwrap_or(0);
            (local - Duration::seconds(offset_secs as i64)).and_utc()
        }
    }
}

/// Check a schedule and return its resolved time zone.
pub fn validate(schedule: &Schedule) -> Result<Tz> {
    if schedule.duration_minutes == 0 {
        return Err(CadenceError::Validation("Duration must be positive".into()));
    }
    if let Some(end) = schedule.end_local
        && end < schedule.start_local
    {
        return Err(CadenceError::Validation(
            "End datetime must not precede start datetime".into(),
        ));
    }

    match (schedule.schedule_type, &schedule.rule) {
        (ScheduleType::OneTime, Some(_)) => {
            return Err(CadenceError::Validation(
                "One-time schedule cannot carry a recurrence rule".into(),
            ));
        }
        (ScheduleType::Recurring, None) => {
            return Err(CadenceError::Validation(
                "Recurring schedule requires a recurrence rule".into(),
            ));
        }
        (_, Some(rule)) => {
            if rule.interval == 0 {
                return Err(CadenceError::Validation("Interval must be at least 1".into()));
            }
            if rule.count.is_some() && rule.until.is_some() {
                return Err(CadenceError::Validation(
                    "Count and until are mutually exclusive".into(),
                ));
            }
            if rule.count == Some(0) {
                return Err(CadenceError::Validation("Count must be at least 1".into()));
            }
            if let Some(days) = &rule.weekdays {
                if rule.frequency != Frequency::Weekly {
                    return Err(CadenceError::Validation(
                        "Weekday list is only valid with weekly frequency".into(),
                    ));
                }
                if days.is_empty() {
                    return Err(CadenceError::Validation(
                        "Weekly weekday list must not be empty".into(),
                    ));
                }
            }
        }
        (ScheduleType::OneTime, None) => {}
    }

    parse_timezone(&schedule.timezone)
}

/// Expand `schedule` into the occurrences intersecting `window`.
///
/// The returned iterator is lazy, finite and `Clone` (clone it to restart).
pub fn expand(schedule: &Schedule, window: TimeWindow) -> Result<OccurrenceIter> {
    let tz = validate(schedule)?;
    Ok(OccurrenceIter::new(schedule, tz, window))
}

/// Last occurrence of a bounded series, `None` for open-ended ones.
pub fn last_occurrence(schedule: &Schedule) -> Result<Option<OccurrenceWindow>> {
    if !schedule.is_bounded() {
        return Ok(None);
    }
    let tz = validate(schedule)?;
    let first = to_utc(&tz, schedule.start_local) - Duration::days(1);
    let window = TimeWindow::new(first, DateTime::<Utc>::MAX_UTC);
    Ok(OccurrenceIter::new(schedule, tz, window).last())
}

/// Whether `instant` is one of the series' start instants.
pub fn generates(schedule: &Schedule, instant: DateTime<Utc>) -> Result<bool> {
    let window = TimeWindow::new(instant, instant + Duration::seconds(1));
    Ok(expand(schedule, window)?.any(|w| w.start == instant))
}

#[derive(Debug, Clone)]
enum Stepper {
    Once,
    Daily { interval: i64 },
    Weekly { interval: i64, anchor: NaiveDate, days: Vec<Weekday> },
    Monthly { interval: i64, day: u32 },
}

/// Lazy occurrence sequence produced by [`expand`].
#[derive(Debug, Clone)]
pub struct OccurrenceIter {
    tz: Tz,
    start_local: NaiveDateTime,
    end_local: Option<NaiveDateTime>,
    duration: Duration,
    stepper: Stepper,
    count: Option<u32>,
    until: Option<NaiveDate>,
    window: TimeWindow,
    period: i64,
    slot: usize,
    emitted: u32,
    last_start: Option<DateTime<Utc>>,
    done: bool,
}

impl OccurrenceIter {
    fn new(schedule: &Schedule, tz: Tz, window: TimeWindow) -> Self {
        let start_local = schedule.start_local;
        let rule = schedule.rule.as_ref();
        let stepper = match (schedule.schedule_type, rule) {
            (ScheduleType::Recurring, Some(rule)) => {
                let interval = rule.interval.max(1) as i64;
                match rule.frequency {
                    Frequency::Daily => Stepper::Daily { interval },
                    Frequency::Weekly => {
                        let mut days = rule
                            .weekdays
                            .clone()
                            .unwrap_or_else(|| vec![start_local.weekday()]);
                        days.sort_by_key(|d| d.num_days_from_monday());
                        days.dedup();
                        let anchor = start_local.date()
                            - Duration::days(start_local.weekday().num_days_from_monday() as i64);
                        Stepper::Weekly { interval, anchor, days }
                    }
                    Frequency::Monthly => Stepper::Monthly { interval, day: start_local.day() },
                }
            }
            _ => Stepper::Once,
        };

        let mut iter = Self {
            tz,
            start_local,
            end_local: schedule.end_local,
            duration: Duration::minutes(schedule.duration_minutes as i64),
            stepper,
            count: rule.and_then(|r| r.count),
            until: rule.and_then(|r| r.until),
            window,
            period: 0,
            slot: 0,
            emitted: 0,
            last_start: None,
            done: window.is_empty(),
        };
        if iter.count.is_none() {
            iter.period = iter.skippable_periods();
        }
        iter
    }

    /// Whole periods that end before the window opens. Only used without a
    /// count, since counting needs every occurrence from the series start.
    fn skippable_periods(&self) -> i64 {
        let window_local = self.window.start.with_timezone(&self.tz).naive_local();
        let Some(scan_from) = window_local
            .checked_sub_signed(self.duration)
            .and_then(|t| t.checked_sub_signed(Duration::days(2)))
        else {
            return 0;
        };
        let from = scan_from.date();
        let start = self.start_local.date();
        if from <= start {
            return 0;
        }
        match &self.stepper {
            Stepper::Once => 0,
            Stepper::Daily { interval } => (from - start).num_days() / interval,
            Stepper::Weekly { interval, anchor, .. } => (from - *anchor).num_days() / 7 / interval,
            Stepper::Monthly { interval, .. } => {
                let months = (from.year() as i64 * 12 + from.month0() as i64)
                    - (start.year() as i64 * 12 + start.month0() as i64);
                (months - 1).max(0) / interval
            }
        }
    }

    /// Next raw local candidate in series order, ignoring bounds and window.
    fn next_local(&mut self) -> Option<NaiveDateTime> {
        let time = self.start_local.time();
        match &self.stepper {
            Stepper::Once => {
                if self.period > 0 {
                    return None;
                }
                self.period = 1;
                Some(self.start_local)
            }
            Stepper::Daily { interval } => {
                let offset = Duration::try_days(self.period * interval)?;
                self.period += 1;
                self.start_local.checked_add_signed(offset)
            }
            Stepper::Weekly { interval, anchor, days } => loop {
                let week_start = anchor.checked_add_signed(Duration::try_days(7 * interval * self.period)?)?;
                let day = days[self.slot];
                self.slot += 1;
                if self.slot == days.len() {
                    self.slot = 0;
                    self.period += 1;
                }
                let date = week_start
                    .checked_add_signed(Duration::days(day.num_days_from_monday() as i64))?;
                let local = date.and_time(time);
                if local < self.start_local {
                    continue;
                }
                return Some(local);
            },
            Stepper::Monthly { interval, day } => {
                let start = self.start_local.date();
                for _ in 0..MAX_SKIPPED_PERIODS {
                    let total = start.year() as i64 * 12 + start.month0() as i64 + self.period * interval;
                    self.period += 1;
                    let year = i32::try_from(total.div_euclid(12)).ok()?;
                    let month = total.rem_euclid(12) as u32 + 1;
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, *day) {
                        return Some(date.and_time(time));
                    }
                }
                None
            }
        }
    }
}

impl Iterator for OccurrenceIter {
    type Item = OccurrenceWindow;

    fn next(&mut self) -> Option<OccurrenceWindow> {
        while !self.done {
            if let Some(count) = self.count
                && self.emitted >= count
            {
                break;
            }
            let Some(local) = self.next_local() else { break };
            if self.until.is_some_and(|until| local.date() > until)
                || self.end_local.is_some_and(|end| local > end)
            {
                break;
            }
            self.emitted += 1;

            let start = to_utc(&self.tz, local);
            if start >= self.window.end {
                break;
            }
            if self.last_start.is_some_and(|last| start <= last) {
                continue;
            }
            self.last_start = Some(start);

            let end = start + self.duration;
            if self.window.intersects(start, end) {
                return Some(OccurrenceWindow { start, end });
            }
        }
        self.done = true;
        None
    }
}

/// Parse a frequency name ("daily", "weekly", "monthly").
pub fn parse_frequency(s: &str) -> Option<Frequency> {
    match s.trim().to_ascii_lowercase().as_str() {
        "daily" | "d" => Some(Frequency::Daily),
        "weekly" | "w" => Some(Frequency::Weekly),
        "monthly" | "m" => Some(Frequency::Monthly),
        _ => None,
    }
}

/// Parse a comma-separated weekday list: "mon,wed,fri".
pub fn parse_weekdays(list: &str) -> Result<Vec<Weekday>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Weekday>()
                .map_err(|_| CadenceError::Validation(format!("Invalid weekday '{s}'")))
        })
        .collect()
}
