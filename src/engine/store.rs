use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;

use crate::model::*;

pub type SharedCalendarState = Arc<RwLock<CalendarState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    User,
    Calendar,
    Slot,
    Meeting,
    Participant,
}

/// Per-kind monotonically increasing id sequences. Ids start at 1 and are never reused.
#[derive(Default)]
struct IdSequences {
    user: AtomicU64,
    calendar: AtomicU64,
    slot: AtomicU64,
    meeting: AtomicU64,
    participant: AtomicU64,
}

impl IdSequences {
    fn counter(&self, kind: IdKind) -> &AtomicU64 {
        match kind {
            IdKind::User => &self.user,
            IdKind::Calendar => &self.calendar,
            IdKind::Slot => &self.slot,
            IdKind::Meeting => &self.meeting,
            IdKind::Participant => &self.participant,
        }
    }
}

/// Arena of users and calendars plus the lookup indexes the engine needs.
/// Calendar contents (slots, meetings, participants) live inside each
/// calendar's `RwLock` and are only mutated through [`InMemoryStore::apply_event`].
pub struct InMemoryStore {
    users: DashMap<Id, User>,
    /// Lowercased email → user id.
    emails: DashMap<String, Id>,
    calendars: DashMap<Id, SharedCalendarState>,
    calendar_by_owner: DashMap<Id, Id>,
    slot_to_calendar: DashMap<Id, Id>,
    seq: IdSequences,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            emails: DashMap::new(),
            calendars: DashMap::new(),
            calendar_by_owner: DashMap::new(),
            slot_to_calendar: DashMap::new(),
            seq: IdSequences::default(),
        }
    }

    // ── Identity ─────────────────────────────────────────────

    pub fn next_id(&self, kind: IdKind) -> Id {
        self.seq.counter(kind).fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make sure the sequence for `kind` never hands out `id` again.
    pub fn observe_id(&self, kind: IdKind, id: Id) {
        self.seq.counter(kind).fetch_max(id, Ordering::Relaxed);
    }

    pub fn watermarks(&self) -> IdWatermarks {
        let get = |kind| self.seq.counter(kind).load(Ordering::Relaxed);
        IdWatermarks {
            user: get(IdKind::User),
            calendar: get(IdKind::Calendar),
            slot: get(IdKind::Slot),
            meeting: get(IdKind::Meeting),
            participant: get(IdKind::Participant),
        }
    }

    pub fn observe_watermarks(&self, w: &IdWatermarks) {
        self.observe_id(IdKind::User, w.user);
        self.observe_id(IdKind::Calendar, w.calendar);
        self.observe_id(IdKind::Slot, w.slot);
        self.observe_id(IdKind::Meeting, w.meeting);
        self.observe_id(IdKind::Participant, w.participant);
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn contains_user(&self, id: Id) -> bool {
        self.users.contains_key(&id)
    }

    pub fn get_user(&self, id: Id) -> Option<User> {
        self.users.get(&id).map(|e| e.value().clone())
    }

    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// Claim `email` for `user_id`. Returns false if another user already holds it.
    pub fn reserve_email(&self, email: &str, user_id: Id) -> bool {
        match self.emails.entry(email.to_lowercase()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(user_id);
                true
            }
        }
    }

    pub fn release_email(&self, email: &str, user_id: Id) {
        self.emails
            .remove_if(&email.to_lowercase(), |_, holder| *holder == user_id);
    }

    // ── Calendars ────────────────────────────────────────────

    pub fn calendar_count(&self) -> usize {
        self.calendars.len()
    }

    pub fn get_calendar(&self, id: Id) -> Option<SharedCalendarState> {
        self.calendars.get(&id).map(|e| e.value().clone())
    }

    pub fn calendar_for_owner(&self, owner_id: Id) -> Option<SharedCalendarState> {
        let calendar_id = *self.calendar_by_owner.get(&owner_id)?;
        self.get_calendar(calendar_id)
    }

    /// Calendars ordered by id.
    pub fn calendars(&self) -> Vec<SharedCalendarState> {
        let mut ids: Vec<Id> = self.calendars.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.get_calendar(id)).collect()
    }

    // ── Slot index ───────────────────────────────────────────

    pub fn calendar_for_slot(&self, slot_id: Id) -> Option<Id> {
        self.slot_to_calendar.get(&slot_id).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply a `UserCreated` event: register the user and its calendar.
    pub fn apply_user_created(&self, user: &User, calendar: &Calendar) {
        self.observe_id(IdKind::User, user.id);
        self.observe_id(IdKind::Calendar, calendar.id);
        self.emails.insert(user.email.to_lowercase(), user.id);
        self.users.insert(user.id, user.clone());
        self.calendars.insert(
            calendar.id,
            Arc::new(RwLock::new(CalendarState::new(calendar.clone()))),
        );
        self.calendar_by_owner.insert(calendar.owner_id, calendar.id);
    }

    /// Apply a calendar-scoped event. Caller holds the calendar's write lock.
    pub fn apply_event(&self, cs: &mut CalendarState, event: &Event) {
        match event {
            Event::SlotCreated { slot } => {
                self.observe_id(IdKind::Slot, slot.id);
                self.slot_to_calendar.insert(slot.id, slot.calendar_id);
                cs.insert_slot(slot.clone());
            }
            Event::SlotRescheduled { id, span, version, .. } => {
                // Re-insert to keep the start ordering.
                if let Some(mut slot) = cs.remove_slot(*id) {
                    slot.span = *span;
                    slot.version = *version;
                    cs.insert_slot(slot);
                }
            }
            Event::SlotStatusChanged {
                id, status, version, ..
            } => {
                if let Some(slot) = cs.slot_mut(*id) {
                    slot.status = *status;
                    slot.version = *version;
                }
            }
            Event::SlotDeleted { id, .. } => {
                if let Some(slot) = cs.remove_slot(*id)
                    && let Some(meeting_id) = slot.meeting_id
                {
                    cs.meetings.remove(&meeting_id);
                    cs.participants.remove(&meeting_id);
                }
                self.slot_to_calendar.remove(id);
            }
            Event::MeetingScheduled {
                meeting,
                participants,
                version,
                ..
            } => {
                self.observe_id(IdKind::Meeting, meeting.id);
                for p in participants {
                    self.observe_id(IdKind::Participant, p.id);
                }
                if let Some(slot) = cs.slot_mut(meeting.slot_id) {
                    slot.status = SlotStatus::Busy;
                    slot.meeting_id = Some(meeting.id);
                    slot.version = *version;
                }
                cs.meetings.insert(meeting.id, meeting.clone());
                cs.participants.insert(meeting.id, participants.clone());
            }
            Event::UserCreated { user, calendar } => self.apply_user_created(user, calendar),
            Event::IdsIssued(w) => self.observe_watermarks(w),
        }
    }
}
