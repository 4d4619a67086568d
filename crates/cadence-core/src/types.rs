//! Routine domain model: routines, schedules, participants, occurrences,
//! invitation states, tasks and reminders.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ─── Parties ──────────────────────────────────────────────

/// Kind of party a reference points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PartyKind {
    User,
    Team,
}

/// Tagged reference to a user or team. Display identity is resolved elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyRef {
    pub kind: PartyKind,
    pub id: String,
}

impl PartyRef {
    pub fn user(id: &str) -> Self {
        Self { kind: PartyKind::User, id: id.to_string() }
    }

    pub fn team(id: &str) -> Self {
        Self { kind: PartyKind::Team, id: id.to_string() }
    }

    /// Stable storage key, e.g. `user:42`.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Parse a storage key produced by [`PartyRef::key`].
    pub fn parse_key(key: &str) -> Option<Self> {
        let (kind, id) = key.split_once(':')?;
        match kind {
            "user" => Some(Self::user(id)),
            "team" => Some(Self::team(id)),
            _ => None,
        }
    }
}

impl fmt::Display for PartyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PartyKind::User => write!(f, "user:{}", self.id),
            PartyKind::Team => write!(f, "team:{}", self.id),
        }
    }
}

// ─── Routine ──────────────────────────────────────────────

/// Routine lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutineStatus {
    Draft,
    Active,
    Cancelled,
    Completed,
}

impl RoutineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutineStatus::Draft => "draft",
            RoutineStatus::Active => "active",
            RoutineStatus::Cancelled => "cancelled",
            RoutineStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoutineStatus::Cancelled | RoutineStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    #[default]
    Members,
    Private,
}

/// Title text keyed by language tag ("en", "fa", ...).
pub type LocalizedText = BTreeMap<String, String>;

/// Where a routine takes place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Physical address or room.
    pub place: Option<String>,
    /// Online platform name (e.g. "Jitsi").
    pub platform: Option<String>,
    pub link: Option<String>,
}

/// A one-time or recurring meeting/activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routine {
    pub id: String,
    pub title: LocalizedText,
    /// Reference to the descriptive content held by the content service.
    pub content_ref: Option<String>,
    pub creator: PartyRef,
    pub status: RoutineStatus,
    #[serde(default)]
    pub visibility: Visibility,
    pub schedule: Schedule,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub linked_projects: Vec<String>,
    #[serde(default)]
    pub linked_teams: Vec<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub reminder_rules: Vec<ReminderRule>,
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
    /// Set when the schedule changed but stored occurrences have not been
    /// re-derived yet. Cleared once rematerialization succeeds.
    #[serde(default)]
    pub rematerialize_pending: bool,
    /// Optimistic concurrency version. 0 = never stored.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Routine {
    /// New draft routine with a generated id.
    pub fn new(title: &str, creator: PartyRef, schedule: Schedule) -> Self {
        let now = Utc::now();
        let mut titles = LocalizedText::new();
        titles.insert("en".to_string(), title.to_string());
        Self {
            id: format!("rtn-{}", uuid::Uuid::new_v4().simple()),
            title: titles,
            content_ref: None,
            creator,
            status: RoutineStatus::Draft,
            visibility: Visibility::default(),
            schedule,
            purpose: String::new(),
            location: None,
            linked_projects: Vec::new(),
            linked_teams: Vec::new(),
            participants: Vec::new(),
            reminder_rules: Vec::new(),
            tasks: Vec::new(),
            rematerialize_pending: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Title in the requested language, falling back to any available one.
    pub fn title_in(&self, lang: &str) -> Option<&str> {
        self.title
            .get(lang)
            .or_else(|| self.title.values().next())
            .map(String::as_str)
    }

    pub fn participant(&self, party: &PartyRef) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.party == party)
    }

    pub fn reminder_rule(&self, rule_id: &str) -> Option<&ReminderRule> {
        self.reminder_rules.iter().find(|r| r.id == rule_id)
    }
}

// ─── Schedule & recurrence ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleType {
    OneTime,
    Recurring,
}

/// When a routine happens, expressed in its own wall-clock time zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_type: ScheduleType,
    /// Wall-clock start in `timezone`.
    pub start_local: NaiveDateTime,
    /// No occurrence starts after this wall-clock moment.
    #[serde(default)]
    pub end_local: Option<NaiveDateTime>,
    #[serde(default)]
    pub rule: Option<RecurrenceRule>,
    pub duration_minutes: u32,
    /// IANA zone id, e.g. "Asia/Tehran".
    pub timezone: String,
}

impl Schedule {
    pub fn one_time(start_local: NaiveDateTime, duration_minutes: u32, timezone: &str) -> Self {
        Self {
            schedule_type: ScheduleType::OneTime,
            start_local,
            end_local: None,
            rule: None,
            duration_minutes,
            timezone: timezone.to_string(),
        }
    }

    pub fn recurring(
        start_local: NaiveDateTime,
        duration_minutes: u32,
        timezone: &str,
        rule: RecurrenceRule,
    ) -> Self {
        Self {
            schedule_type: ScheduleType::Recurring,
            start_local,
            end_local: None,
            rule: Some(rule),
            duration_minutes,
            timezone: timezone.to_string(),
        }
    }

    /// A series is bounded when it cannot generate occurrences forever.
    pub fn is_bounded(&self) -> bool {
        match (&self.schedule_type, &self.rule) {
            (ScheduleType::OneTime, _) => true,
            (_, Some(rule)) => rule.count.is_some() || rule.until.is_some() || self.end_local.is_some(),
            (_, None) => self.end_local.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// Supported recurrence-rule subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    /// Multiplier of the frequency unit; must be >= 1.
    pub interval: u32,
    /// Weekly only; at least one entry when present.
    #[serde(default)]
    pub weekdays: Option<Vec<Weekday>>,
    #[serde(default)]
    pub count: Option<u32>,
    /// Inclusive last local date.
    #[serde(default)]
    pub until: Option<NaiveDate>,
}

impl RecurrenceRule {
    pub fn daily(interval: u32) -> Self {
        Self { frequency: Frequency::Daily, interval, weekdays: None, count: None, until: None }
    }

    pub fn weekly(interval: u32, weekdays: Vec<Weekday>) -> Self {
        Self {
            frequency: Frequency::Weekly,
            interval,
            weekdays: if weekdays.is_empty() { None } else { Some(weekdays) },
            count: None,
            until: None,
        }
    }

    pub fn monthly(interval: u32) -> Self {
        Self { frequency: Frequency::Monthly, interval, weekdays: None, count: None, until: None }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_until(mut self, until: NaiveDate) -> Self {
        self.until = Some(until);
        self
    }
}

// ─── Participants & invitations ───────────────────────────

/// Invitation status of a participant for one occurrence (or routine default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvitationStatus {
    NotInvited,
    Invited,
    Accepted,
    Declined,
    Tentative,
}

impl InvitationStatus {
    /// Statuses a participant can set through an RSVP.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            InvitationStatus::Accepted | InvitationStatus::Declined | InvitationStatus::Tentative
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::NotInvited => "not_invited",
            InvitationStatus::Invited => "invited",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Declined => "declined",
            InvitationStatus::Tentative => "tentative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_invited" => Some(InvitationStatus::NotInvited),
            "invited" => Some(InvitationStatus::Invited),
            "accepted" => Some(InvitationStatus::Accepted),
            "declined" => Some(InvitationStatus::Declined),
            "tentative" => Some(InvitationStatus::Tentative),
            _ => None,
        }
    }
}

/// A user or team listed on a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub party: PartyRef,
    /// Free-form role label, e.g. "Organizer".
    pub role: String,
    #[serde(default)]
    pub optional: bool,
    /// Routine-level default applied to every non-overridden occurrence.
    pub default_status: InvitationStatus,
}

impl Participant {
    pub fn new(party: PartyRef, role: &str, default_status: InvitationStatus) -> Self {
        Self { party, role: role.to_string(), optional: false, default_status }
    }

    pub fn organizer(party: PartyRef) -> Self {
        Self::new(party, "Organizer", InvitationStatus::Accepted)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn is_organizer(&self) -> bool {
        self.role.eq_ignore_ascii_case("organizer")
    }
}

/// Invitation status of one participant for one occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantOccurrenceState {
    pub occurrence_id: String,
    pub party: PartyRef,
    pub status: InvitationStatus,
    /// True once this occurrence diverged from the routine-level default.
    pub overridden: bool,
    pub last_updated_at: DateTime<Utc>,
}

// ─── Occurrences ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OccurrenceStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl OccurrenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccurrenceStatus::Scheduled => "scheduled",
            OccurrenceStatus::InProgress => "in_progress",
            OccurrenceStatus::Completed => "completed",
            OccurrenceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(OccurrenceStatus::Scheduled),
            "in_progress" => Some(OccurrenceStatus::InProgress),
            "completed" => Some(OccurrenceStatus::Completed),
            "cancelled" => Some(OccurrenceStatus::Cancelled),
            _ => None,
        }
    }
}

/// One concrete, time-bound instance of a routine's schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    /// Deterministic id derived from (routine_id, start).
    pub id: String,
    pub routine_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: OccurrenceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// True when `[start, end)` overlaps this window.
    pub fn intersects(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }
}

// ─── Tasks ────────────────────────────────────────────────

/// Who a per-occurrence task is assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskAssignee {
    Role(String),
    User(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DueAnchor {
    Start,
    End,
}

/// Due moment relative to the occurrence (negative offset = before the anchor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueCondition {
    pub anchor: DueAnchor,
    pub offset_minutes: i64,
}

/// A task or action to perform for every occurrence of a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub assignee: TaskAssignee,
    pub due: DueCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Completed,
    Skipped,
}

/// Recorded completion status of a task for one occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub occurrence_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
}

// ─── Reminders ────────────────────────────────────────────

/// Who receives a reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientScope {
    AllParticipants,
    OrganizersOnly,
    /// Participants whose role matches (case-insensitive).
    Role(String),
}

/// Send a reminder `lead_minutes` before each occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderRule {
    pub id: String,
    pub lead_minutes: u32,
    pub scope: RecipientScope,
    /// Preferred delivery channel ("email", "chat", ...).
    #[serde(default)]
    pub channel: Option<String>,
}

impl ReminderRule {
    pub fn new(id: &str, lead_minutes: u32, scope: RecipientScope) -> Self {
        Self { id: id.to_string(), lead_minutes, scope, channel: None }
    }
}

/// Dedup key: at most one receipt exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptKey {
    pub rule_id: String,
    pub occurrence_id: String,
    pub party: PartyRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeliveryResult {
    Delivered,
    /// Gave up after the configured number of attempts.
    Failed(String),
}

/// Durable proof that a reminder was dispatched (or abandoned).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderReceipt {
    pub key: ReceiptKey,
    pub dispatched_at: DateTime<Utc>,
    pub result: DeliveryResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_key_roundtrip() {
        let team = PartyRef::team("design");
        assert_eq!(team.key(), "team:design");
        assert_eq!(PartyRef::parse_key("team:design"), Some(team));
        assert_eq!(PartyRef::parse_key("group:x"), None);
    }

    #[test]
    fn test_organizer_role_case_insensitive() {
        let p = Participant::new(PartyRef::user("1"), "organizer", InvitationStatus::Invited);
        assert!(p.is_organizer());
        let p = Participant::new(PartyRef::user("2"), "Speaker", InvitationStatus::Invited);
        assert!(!p.is_organizer());
    }

    #[test]
    fn test_bounded_series() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let open = Schedule::recurring(start, 60, "UTC", RecurrenceRule::daily(1));
        assert!(!open.is_bounded());
        let counted = Schedule::recurring(start, 60, "UTC", RecurrenceRule::daily(1).with_count(3));
        assert!(counted.is_bounded());
        assert!(Schedule::one_time(start, 60, "UTC").is_bounded());
    }

    #[test]
    fn test_window_intersection_is_half_open() {
        let a = Utc::now();
        let w = TimeWindow::new(a, a + chrono::Duration::hours(1));
        assert!(w.contains(a));
        assert!(!w.contains(a + chrono::Duration::hours(1)));
        assert!(!w.intersects(a - chrono::Duration::hours(1), a));
        assert!(w.intersects(a - chrono::Duration::minutes(1), a + chrono::Duration::minutes(1)));
    }

    #[test]
    fn test_routine_title_fallback() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let mut r = Routine::new("Standup", PartyRef::user("u1"), Schedule::one_time(start, 15, "UTC"));
        assert_eq!(r.title_in("fa"), Some("Standup"));
        r.title.insert("fa".into(), "جلسه".into());
        assert_eq!(r.title_in("fa"), Some("جلسه"));
        assert_eq!(r.status, RoutineStatus::Draft);
        assert_eq!(r.version, 0);
    }
}
