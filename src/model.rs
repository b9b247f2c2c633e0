use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` for zero-length or inverted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Widen both ends by `buffer`.
    pub fn padded(&self, buffer: Ms) -> Span {
        Span::new(self.start - buffer, self.end + buffer)
    }

    /// Same duration, new start.
    pub fn shifted_to(&self, start: Ms) -> Span {
        Span::new(start, start + self.duration_ms())
    }

    /// UTC calendar day of the first instant.
    pub fn first_day(&self) -> i64 {
        self.start.div_euclid(DAY_MS)
    }

    /// UTC calendar day of the last instant.
    pub fn last_day(&self) -> i64 {
        (self.end - 1).div_euclid(DAY_MS)
    }
}

/// Parse an instant literal: Unix milliseconds, RFC 3339, or a zone-less
/// `YYYY-MM-DDTHH:MM[:SS]` read as UTC.
pub fn parse_instant(text: &str) -> Option<Ms> {
    let text = text.trim();
    if let Ok(ms) = text.parse::<Ms>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal $(| $alias:literal)*),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(text: &str) -> Option<Self> {
                match text.trim().to_lowercase().as_str() {
                    $($text $(| $alias)* => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Equipment {
    Whiteboard,
    Projector,
    Computer,
    SoundSystem,
    Microphone,
    Camera,
}

string_enum!(Equipment {
    Whiteboard => "whiteboard",
    Projector => "projector",
    Computer => "computer",
    SoundSystem => "sound_system" | "sound system",
    Microphone => "microphone",
    Camera => "camera",
});

/// Parse a comma-separated equipment list. Returns the first unknown tag on failure.
pub fn parse_equipment_list(text: &str) -> Result<BTreeSet<Equipment>, String> {
    text.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| Equipment::parse(t).ok_or_else(|| t.to_string()))
        .collect()
}

pub fn format_equipment(set: &BTreeSet<Equipment>) -> String {
    set.iter().map(Equipment::as_str).collect::<Vec<_>>().join(",")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    /// Directory key; this is what session locations refer to.
    pub name: String,
    pub building: String,
    pub floor: i32,
    pub capacity: u32,
    pub equipment: BTreeSet<Equipment>,
}

impl Room {
    pub fn supports(&self, required: &BTreeSet<Equipment>) -> bool {
        required.is_subset(&self.equipment)
    }

    pub fn missing_equipment(&self, required: &BTreeSet<Equipment>) -> Vec<Equipment> {
        required.difference(&self.equipment).copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub session_id: Ulid,
    pub span: Span,
}

/// A room plus the sessions currently placed in it, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub occupancy: Vec<Occupancy>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            occupancy: Vec::new(),
        }
    }

    pub fn insert_occupancy(&mut self, occupancy: Occupancy) {
        let pos = self
            .occupancy
            .partition_point(|o| o.span.start <= occupancy.span.start);
        self.occupancy.insert(pos, occupancy);
    }

    pub fn remove_occupancy(&mut self, session_id: Ulid) -> Option<Occupancy> {
        let pos = self.occupancy.iter().position(|o| o.session_id == session_id)?;
        Some(self.occupancy.remove(pos))
    }

    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Occupancy> {
        let right_bound = self.occupancy.partition_point(|o| o.span.start < query.end);
        self.occupancy[..right_bound]
            .iter()
            .filter(move |o| o.span.end > query.start)
    }
}

// ── Sessions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Online,
    Offline,
}

string_enum!(Mode {
    Online => "online",
    Offline => "offline",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

string_enum!(SessionStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Completed => "completed",
    Cancelled => "cancelled" | "canceled",
});

impl SessionStatus {
    /// Open for changes: not yet held, not yet finished.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Confirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub tutor_id: String,
    /// Ordered, duplicate-free, never empty.
    pub student_ids: Vec<String>,
    pub subject: String,
    pub span: Span,
    pub mode: Mode,
    /// Room name when offline.
    pub location: Option<String>,
    pub meeting_link: Option<String>,
    pub status: SessionStatus,
    pub equipment: BTreeSet<Equipment>,
    /// Set for sessions belonging to a recurring class.
    pub class_id: Option<String>,
    pub notes: Option<String>,
    pub group_limit: Option<u32>,
    pub split_from: Option<Ulid>,
    pub merged_from: Vec<Ulid>,
    pub superseded_by: Option<Ulid>,
}

impl Session {
    pub fn is_group(&self) -> bool {
        self.student_ids.len() > 1
    }

    pub fn is_offline(&self) -> bool {
        self.mode == Mode::Offline
    }

    /// Whether this session counts against its tutor's time.
    /// Class-linked sessions are fixed commitments tracked elsewhere.
    pub fn blocks_tutor(&self) -> bool {
        self.status != SessionStatus::Cancelled && self.class_id.is_none()
    }

    /// Room this session holds, if any.
    pub fn occupied_room(&self) -> Option<&str> {
        if self.mode != Mode::Offline || self.status == SessionStatus::Cancelled {
            return None;
        }
        self.location.as_deref().map(str::trim).filter(|l| !l.is_empty())
    }

    pub fn was_merged(&self) -> bool {
        !self.merged_from.is_empty() || self.superseded_by.is_some()
    }
}

/// Everything one tutor is committed to, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct TutorState {
    pub tutor_id: String,
    /// Availability windows, sorted by start. May overlap; merged on read.
    pub availability: Vec<Span>,
    pub sessions: Vec<Session>,
}

impl TutorState {
    pub fn new(tutor_id: &str) -> Self {
        Self {
            tutor_id: tutor_id.to_string(),
            availability: Vec::new(),
            sessions: Vec::new(),
        }
    }

    pub fn insert_session(&mut self, session: Session) {
        let pos = self
            .sessions
            .partition_point(|s| s.span.start <= session.span.start);
        self.sessions.insert(pos, session);
    }

    pub fn remove_session(&mut self, id: Ulid) -> Option<Session> {
        let pos = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(pos))
    }

    pub fn session(&self, id: Ulid) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn add_availability(&mut self, span: Span) {
        let pos = self.availability.partition_point(|w| w.start <= span.start);
        self.availability.insert(pos, span);
    }

    /// Sessions whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Session> {
        let right_bound = self.sessions.partition_point(|s| s.span.start < query.end);
        self.sessions[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

// ── Change requests ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    SessionChange,
    ResourceAllocation,
}

string_enum!(RequestKind {
    SessionChange => "session_change",
    ResourceAllocation => "resource_allocation",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    ClarificationRequested,
    Approved,
    Rejected,
    Escalated,
}

string_enum!(RequestStatus {
    Pending => "pending",
    ClarificationRequested => "clarification_requested",
    Approved => "approved",
    Rejected => "rejected",
    Escalated => "escalated",
});

impl RequestStatus {
    /// Still awaiting a decision from a reviewer.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            RequestStatus::Pending | RequestStatus::ClarificationRequested
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

string_enum!(Priority {
    Low => "low",
    Medium => "medium" | "normal",
    High => "high",
    Urgent => "urgent",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationChange {
    pub new_span: Span,
    pub new_duration_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationChange {
    pub online: bool,
    pub location: Option<String>,
    pub meeting_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeChange {
    /// Fold these sessions into the first one.
    Merge { session_ids: Vec<Ulid> },
    /// Break a group session into one session per student.
    Split { into: u32 },
}

/// What a `session_change` request does. One variant per `changeType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionChange {
    Duration(DurationChange),
    Location(LocationChange),
    Type(TypeChange),
}

impl SessionChange {
    pub fn change_type(&self) -> &'static str {
        match self {
            SessionChange::Duration(_) => "change_duration",
            SessionChange::Location(_) => "change_location",
            SessionChange::Type(_) => "change_type",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    ReallocateRoom,
    ReassignTutor,
    AdjustGroupSize,
    AdjustSchedule,
}

string_enum!(AllocationKind {
    ReallocateRoom => "reallocate_room",
    ReassignTutor => "reassign_tutor",
    AdjustGroupSize => "adjust_group_size",
    AdjustSchedule => "adjust_schedule",
});

/// One atomic entry of a resource-allocation plan. `resource_id` names a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationChange {
    pub resource_id: Ulid,
    pub kind: AllocationKind,
    #[serde(default)]
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    SessionChange {
        session_id: Ulid,
        change: SessionChange,
        /// Set at build time when the target was offline and a reschedule
        /// means the room has to be re-confirmed.
        requires_room: bool,
    },
    ResourceAllocation {
        changes: Vec<AllocationChange>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: Ulid,
    pub proposer: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub status: RequestStatus,
    pub payload: RequestPayload,
    pub reviewer: Option<String>,
    pub review_notes: Option<String>,
    /// Room supplied with the approval.
    pub approved_location: Option<String>,
    pub clarification_request: Option<String>,
    pub clarification_response: Option<String>,
    pub deadline: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub resolved_at: Option<Ms>,
}

impl ChangeRequest {
    pub fn kind(&self) -> RequestKind {
        match self.payload {
            RequestPayload::SessionChange { .. } => RequestKind::SessionChange,
            RequestPayload::ResourceAllocation { .. } => RequestKind::ResourceAllocation,
        }
    }

    pub fn target_session(&self) -> Option<Ulid> {
        match &self.payload {
            RequestPayload::SessionChange { session_id, .. } => Some(*session_id),
            RequestPayload::ResourceAllocation { .. } => None,
        }
    }

    pub fn change_type(&self) -> Option<&'static str> {
        match &self.payload {
            RequestPayload::SessionChange { change, .. } => Some(change.change_type()),
            RequestPayload::ResourceAllocation { .. } => None,
        }
    }

    /// Approval must carry a room name.
    pub fn requires_room(&self) -> bool {
        match &self.payload {
            RequestPayload::SessionChange { requires_room, .. } => *requires_room,
            RequestPayload::ResourceAllocation { changes } => changes
                .iter()
                .any(|c| c.kind == AllocationKind::ReallocateRoom),
        }
    }

    /// Every existing session the approval would read or write.
    pub fn touched_sessions(&self) -> Vec<Ulid> {
        let mut ids = match &self.payload {
            RequestPayload::SessionChange {
                session_id,
                change: SessionChange::Type(TypeChange::Merge { session_ids }),
                ..
            } => {
                let mut ids = vec![*session_id];
                ids.extend(session_ids.iter().copied());
                ids
            }
            RequestPayload::SessionChange { session_id, .. } => vec![*session_id],
            RequestPayload::ResourceAllocation { changes } => {
                changes.iter().map(|c| c.resource_id).collect()
            }
        };
        let mut seen = BTreeSet::new();
        ids.retain(|id| seen.insert(*id));
        ids
    }
}

// ── Optimisation plans ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FocusArea {
    Workload,
    Rooms,
    GroupSize,
    Schedule,
}

string_enum!(FocusArea {
    Workload => "workload",
    Rooms => "rooms" | "room_utilization",
    GroupSize => "group_size",
    Schedule => "schedule",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanConstraints {
    pub window: Span,
    /// Sessions per tutor inside the window before reassignments are proposed.
    /// `None` means "well above the mean".
    pub max_sessions_per_tutor: Option<u32>,
    pub max_group_size: Option<u32>,
    /// Students / capacity, in percent, below which a smaller room is proposed.
    pub min_room_utilization_pct: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpactSummary {
    pub room_reallocations: usize,
    pub tutor_reassignments: usize,
    pub group_adjustments: usize,
    pub schedule_adjustments: usize,
    pub tutors_affected: usize,
    pub minutes_moved: i64,
}

/// Suggested allocation changes. Not binding on its own: a proposer copies a
/// subset into a `resource_allocation` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizationPlan {
    pub id: Ulid,
    pub generated_at: Ms,
    pub window: Span,
    pub changes: Vec<AllocationChange>,
    pub impact: ImpactSummary,
}

impl OptimizationPlan {
    /// Pick changes by index. Unknown indices yield `None`.
    pub fn select(&self, indices: &[usize]) -> Option<Vec<AllocationChange>> {
        indices.iter().map(|&i| self.changes.get(i).cloned()).collect()
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Tutor,
    Management,
    Optimizer,
    /// Background tasks. Never granted to a login.
    System,
}

string_enum!(Role {
    Student => "student",
    Tutor => "tutor",
    Management => "management" | "manager",
    Optimizer => "optimizer",
    System => "system",
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn system() -> Self {
        Self::new("system", Role::System)
    }

    pub fn is_reviewer(&self) -> bool {
        matches!(self.role, Role::Management | Role::System)
    }
}

// ── Journal records ──────────────────────────────────────────────

/// Journal record format. Every record is a full snapshot of what it touches,
/// so replay is an upsert per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered {
        room: Room,
    },
    AvailabilityAdded {
        tutor_id: String,
        span: Span,
    },
    SessionUpserted {
        session: Session,
    },
    RequestUpserted {
        request: ChangeRequest,
    },
    /// An approval: the request in its final state plus every session it wrote.
    ChangeApplied {
        request: ChangeRequest,
        sessions: Vec<Session>,
    },
}

/// Result of a single conflict check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictReport {
    pub session_id: Ulid,
    pub span: Span,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn session(tutor: &str, students: &[&str], start: Ms, end: Ms) -> Session {
        Session {
            id: Ulid::new(),
            tutor_id: tutor.to_string(),
            student_ids: students.iter().map(|s| s.to_string()).collect(),
            subject: "Calculus".into(),
            span: Span::new(start, end),
            mode: Mode::Online,
            location: None,
            meeting_link: Some("https://meet.example/abc".into()),
            status: SessionStatus::Confirmed,
            equipment: BTreeSet::new(),
            class_id: None,
            notes: None,
            group_limit: None,
            split_from: None,
            merged_from: Vec::new(),
            superseded_by: None,
        }
    }

    pub fn room(name: &str, capacity: u32, equipment: &[Equipment]) -> Room {
        Room {
            id: Ulid::new(),
            name: name.to_string(),
            building: name[..1].to_string(),
            floor: 1,
            capacity,
            equipment: equipment.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    const H: Ms = 3_600_000;

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_try_new_rejects_inverted_and_empty() {
        assert!(Span::try_new(100, 100).is_none());
        assert!(Span::try_new(200, 100).is_none());
        assert_eq!(Span::try_new(100, 101), Some(Span::new(100, 101)));
    }

    #[test]
    fn span_padded_and_shifted() {
        let s = Span::new(10 * H, 11 * H);
        assert_eq!(s.padded(H), Span::new(9 * H, 12 * H));
        assert_eq!(s.shifted_to(14 * H), Span::new(14 * H, 15 * H));
        assert_eq!(s.duration_minutes(), 60);
    }

    #[test]
    fn span_calendar_days() {
        // 23:00 → 01:00 touches two UTC days
        let s = Span::new(23 * H, 25 * H);
        assert_eq!(s.first_day(), 0);
        assert_eq!(s.last_day(), 1);
        // ends exactly at midnight: last instant is still day 0
        let t = Span::new(22 * H, 24 * H);
        assert_eq!(t.last_day(), 0);
    }

    #[test]
    fn parse_instant_formats() {
        assert_eq!(parse_instant("1000"), Some(1000));
        assert_eq!(parse_instant("1970-01-01T00:00:01Z"), Some(1000));
        assert_eq!(parse_instant("1970-01-01T01:00:00+01:00"), Some(0));
        assert_eq!(parse_instant("1970-01-01T00:01"), Some(60_000));
        assert_eq!(parse_instant("yesterday"), None);
    }

    #[test]
    fn equipment_list_parsing() {
        let set = parse_equipment_list("projector, sound system ,whiteboard").unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.contains(&Equipment::SoundSystem));
        assert_eq!(format_equipment(&set), "whiteboard,projector,sound_system");
        assert_eq!(parse_equipment_list("projector,laser"), Err("laser".to_string()));
        assert!(parse_equipment_list("").unwrap().is_empty());
    }

    #[test]
    fn room_equipment_check() {
        let r = room("B203", 30, &[Equipment::Projector, Equipment::Whiteboard]);
        let need: BTreeSet<_> = [Equipment::Projector].into_iter().collect();
        assert!(r.supports(&need));
        let need: BTreeSet<_> = [Equipment::Camera, Equipment::Projector].into_iter().collect();
        assert_eq!(r.missing_equipment(&need), vec![Equipment::Camera]);
    }

    #[test]
    fn tutor_sessions_stay_sorted() {
        let mut ts = TutorState::new("t1");
        ts.insert_session(session("t1", &["s1"], 3 * H, 4 * H));
        ts.insert_session(session("t1", &["s2"], H, 2 * H));
        ts.insert_session(session("t1", &["s3"], 2 * H, 3 * H));
        let starts: Vec<_> = ts.sessions.iter().map(|s| s.span.start).collect();
        assert_eq!(starts, vec![H, 2 * H, 3 * H]);
    }

    #[test]
    fn tutor_overlapping_is_half_open() {
        let mut ts = TutorState::new("t1");
        ts.insert_session(session("t1", &["s1"], H, 2 * H));
        ts.insert_session(session("t1", &["s2"], 5 * H, 6 * H));
        assert_eq!(ts.overlapping(&Span::new(2 * H, 5 * H)).count(), 0);
        assert_eq!(ts.overlapping(&Span::new(2 * H - 1, 5 * H + 1)).count(), 2);
    }

    #[test]
    fn remove_session_by_id() {
        let mut ts = TutorState::new("t1");
        let s = session("t1", &["s1"], H, 2 * H);
        let id = s.id;
        ts.insert_session(s);
        assert!(ts.remove_session(Ulid::new()).is_none());
        assert_eq!(ts.remove_session(id).map(|s| s.id), Some(id));
        assert!(ts.sessions.is_empty());
    }

    #[test]
    fn room_occupancy_index() {
        let mut rs = RoomState::new(room("A101", 10, &[]));
        let a = Ulid::new();
        let b = Ulid::new();
        rs.insert_occupancy(Occupancy { session_id: b, span: Span::new(3 * H, 4 * H) });
        rs.insert_occupancy(Occupancy { session_id: a, span: Span::new(H, 2 * H) });
        assert_eq!(rs.occupancy[0].session_id, a);
        assert_eq!(rs.overlapping(&Span::new(2 * H, 3 * H)).count(), 0);
        assert_eq!(rs.remove_occupancy(a).map(|o| o.session_id), Some(a));
        assert_eq!(rs.occupancy.len(), 1);
    }

    #[test]
    fn occupied_room_rules() {
        let mut s = session("t1", &["s1"], H, 2 * H);
        assert_eq!(s.occupied_room(), None); // online
        s.mode = Mode::Offline;
        s.location = Some(" A101 ".into());
        assert_eq!(s.occupied_room(), Some("A101"));
        s.status = SessionStatus::Cancelled;
        assert_eq!(s.occupied_room(), None);
    }

    #[test]
    fn class_linked_sessions_do_not_block() {
        let mut s = session("t1", &["s1"], H, 2 * H);
        assert!(s.blocks_tutor());
        s.class_id = Some("MATH101".into());
        assert!(!s.blocks_tutor());
    }

    #[test]
    fn status_strings() {
        assert_eq!(RequestStatus::parse("Clarification_Requested"), Some(RequestStatus::ClarificationRequested));
        assert_eq!(RequestStatus::Escalated.to_string(), "escalated");
        assert_eq!(SessionStatus::parse("canceled"), Some(SessionStatus::Cancelled));
        assert_eq!(Role::parse("manager"), Some(Role::Management));
        assert!(Priority::parse("whenever").is_none());
    }

    #[test]
    fn requires_room_for_reallocations() {
        let change = |kind| AllocationChange {
            resource_id: Ulid::new(),
            kind,
            from: String::new(),
            to: "x".into(),
            rationale: String::new(),
        };
        let mut req = ChangeRequest {
            id: Ulid::new(),
            proposer: "m1".into(),
            title: "t".into(),
            description: None,
            priority: Priority::Medium,
            status: RequestStatus::Pending,
            payload: RequestPayload::ResourceAllocation {
                changes: vec![change(AllocationKind::ReassignTutor)],
            },
            reviewer: None,
            review_notes: None,
            approved_location: None,
            clarification_request: None,
            clarification_response: None,
            deadline: None,
            created_at: 0,
            updated_at: 0,
            resolved_at: None,
        };
        assert!(!req.requires_room());
        req.payload = RequestPayload::ResourceAllocation {
            changes: vec![
                change(AllocationKind::ReassignTutor),
                change(AllocationKind::ReallocateRoom),
            ],
        };
        assert!(req.requires_room());
        assert_eq!(req.touched_sessions().len(), 2);
    }

    #[test]
    fn allocation_change_json_shape() {
        let id = Ulid::new();
        let json = format!(
            r#"{{"resourceId":"{id}","kind":"reallocate_room","from":"A101","to":"B203","rationale":"too small"}}"#
        );
        let change: AllocationChange = serde_json::from_str(&json).unwrap();
        assert_eq!(change.resource_id, id);
        assert_eq!(change.kind, AllocationKind::ReallocateRoom);
        assert_eq!(change.to, "B203");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let mut s = session("t1", &["s1", "s2"], H, 2 * H);
        s.equipment.insert(Equipment::Camera);
        let event = Event::SessionUpserted { session: s };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
