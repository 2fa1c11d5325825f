use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Integer identity shared by every entity kind.
pub type Id = u64;

pub const MINUTE_MS: Ms = 60_000;

/// Render a timestamp as RFC 3339 for logs and error messages.
pub fn fmt_ms(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", fmt_ms(self.start), fmt_ms(self.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Free,
    Busy,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Free => "FREE",
            SlotStatus::Busy => "BUSY",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(SlotStatus::Free),
            "BUSY" => Ok(SlotStatus::Busy),
            other => Err(format!("unknown slot status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: Id,
    pub owner_id: Id,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Id,
    pub calendar_id: Id,
    pub span: Span,
    pub status: SlotStatus,
    pub meeting_id: Option<Id>,
    /// Bumped on every committed change; compared against caller expectations.
    pub version: u64,
}

impl Slot {
    /// A freshly created slot is always FREE, unbooked, version 0.
    pub fn new(id: Id, calendar_id: Id, span: Span) -> Self {
        Self {
            id,
            calendar_id,
            span,
            status: SlotStatus::Free,
            meeting_id: None,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Id,
    pub slot_id: Id,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Id,
    pub meeting_id: Id,
    pub user_id: Id,
}

/// Everything owned by one calendar. Guarded as a unit by the engine.
#[derive(Debug, Clone)]
pub struct CalendarState {
    pub calendar: Calendar,
    /// Sorted by `span.start`.
    pub slots: Vec<Slot>,
    pub meetings: HashMap<Id, Meeting>,
    /// Meeting id → participants in insertion order.
    pub participants: HashMap<Id, Vec<Participant>>,
}

impl CalendarState {
    pub fn new(calendar: Calendar) -> Self {
        Self {
            calendar,
            slots: Vec::new(),
            meetings: HashMap::new(),
            participants: HashMap::new(),
        }
    }

    pub fn owner_id(&self) -> Id {
        self.calendar.owner_id
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Id) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: Id) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: Id) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    /// Slots whose stored interval intersects `query` (half-open, touching excluded).
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &Slot> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    /// Slots whose start lies in `[window.start, window.end)`.
    pub fn starting_within(&self, window: Span) -> &[Slot] {
        let lo = self.slots.partition_point(|s| s.span.start < window.start);
        let hi = self.slots.partition_point(|s| s.span.start < window.end);
        &self.slots[lo..hi]
    }

    pub fn meeting_info(&self, meeting_id: Id) -> Option<MeetingInfo> {
        let meeting = self.meetings.get(&meeting_id)?;
        let participant_user_ids = self
            .participants
            .get(&meeting_id)
            .map(|ps| ps.iter().map(|p| p.user_id).collect())
            .unwrap_or_default();
        Some(MeetingInfo {
            id: meeting.id,
            slot_id: meeting.slot_id,
            title: meeting.title.clone(),
            description: meeting.description.clone(),
            participant_user_ids,
        })
    }
}

/// The event types: flat, no nesting beyond entity records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated {
        user: User,
        calendar: Calendar,
    },
    SlotCreated {
        slot: Slot,
    },
    SlotRescheduled {
        id: Id,
        calendar_id: Id,
        span: Span,
        version: u64,
    },
    SlotStatusChanged {
        id: Id,
        calendar_id: Id,
        status: SlotStatus,
        version: u64,
    },
    SlotDeleted {
        id: Id,
        calendar_id: Id,
    },
    MeetingScheduled {
        meeting: Meeting,
        participants: Vec<Participant>,
        calendar_id: Id,
        version: u64,
    },
    /// Highest ids handed out so far. Written by compaction so deleted ids stay retired.
    IdsIssued(IdWatermarks),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdWatermarks {
    pub user: Id,
    pub calendar: Id,
    pub slot: Id,
    pub meeting: Id,
    pub participant: Id,
}

impl Event {
    /// Calendar the event mutates, if it targets an existing one.
    pub fn calendar_id(&self) -> Option<Id> {
        match self {
            Event::SlotCreated { slot } => Some(slot.calendar_id),
            Event::SlotRescheduled { calendar_id, .. }
            | Event::SlotStatusChanged { calendar_id, .. }
            | Event::SlotDeleted { calendar_id, .. }
            | Event::MeetingScheduled { calendar_id, .. } => Some(*calendar_id),
            Event::UserCreated { .. } | Event::IdsIssued(_) => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreeBusy {
    pub busy: Vec<Span>,
    pub free: Vec<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeetingInfo {
    pub id: Id,
    pub slot_id: Id,
    pub title: String,
    pub description: Option<String>,
    pub participant_user_ids: Vec<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotSort {
    #[default]
    Start,
    End,
    Status,
    Id,
}

impl FromStr for SlotSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" | "start_time" | "starttime" => Ok(SlotSort::Start),
            "end" | "end_time" | "endtime" => Ok(SlotSort::End),
            "status" => Ok(SlotSort::Status),
            "id" => Ok(SlotSort::Id),
            other => Err(format!("unknown sort field: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Anything that is not DESC sorts ascending.
        if s.trim().eq_ignore_ascii_case("desc") {
            Ok(SortDirection::Desc)
        } else {
            Ok(SortDirection::Asc)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
    pub sort: SlotSort,
    pub direction: SortDirection,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            size: crate::limits::DEFAULT_PAGE_SIZE,
            sort: SlotSort::default(),
            direction: SortDirection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub size: usize,
    pub total_items: usize,
    pub total_pages: usize,
}
