use std::collections::HashSet;

use tokio::sync::oneshot;

use crate::limits::*;
use crate::model::*;
use crate::observability::ENGINE_OPERATIONS_TOTAL;

use super::conflict::{check_no_overlap, check_version, ensure_owner, validate_duration, validate_order};
use super::{ConflictReason, Engine, EngineError, Entity, IdKind, WalCommand};

fn count_op(op: &'static str) {
    metrics::counter!(ENGINE_OPERATIONS_TOTAL, "op" => op).increment(1);
}

fn validate_email(email: &str) -> Result<(), EngineError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    let well_formed = !email.chars().any(char::is_whitespace)
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty() && !domain.contains('@'));
    if !well_formed {
        return Err(EngineError::InvalidArgument(format!("invalid email: {email:?}")));
    }
    Ok(())
}

fn validate_user_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    if name.trim().is_empty() {
        return Err(EngineError::InvalidArgument("name must not be blank".into()));
    }
    if !name.chars().all(|c| c.is_ascii_alphabetic() || c == ' ') {
        return Err(EngineError::InvalidArgument(
            "name may contain only letters and spaces".into(),
        ));
    }
    Ok(())
}

fn validate_meeting_request(
    title: &str,
    description: Option<&str>,
    participant_user_ids: &[Id],
) -> Result<(), EngineError> {
    if title.trim().is_empty() {
        return Err(EngineError::InvalidArgument("title must not be blank".into()));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::InvalidArgument(format!(
            "title longer than {MAX_TITLE_LEN} bytes"
        )));
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::InvalidArgument(format!(
            "description longer than {MAX_DESCRIPTION_LEN} bytes"
        )));
    }
    if participant_user_ids.is_empty() {
        return Err(EngineError::InvalidArgument(
            "at least one participant is required".into(),
        ));
    }
    if participant_user_ids.len() > MAX_PARTICIPANTS {
        return Err(EngineError::InvalidArgument(format!(
            "more than {MAX_PARTICIPANTS} participants"
        )));
    }
    Ok(())
}

/// Distinct ids in first-seen order.
fn dedupe_preserving_order(ids: &[Id]) -> Vec<Id> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    /// Register a user together with their `Personal` calendar.
    pub async fn create_user(&self, email: &str, name: &str) -> Result<User, EngineError> {
        validate_email(email)?;
        validate_user_name(name)?;

        let _commit = self.commit_gate.read().await;
        let user_id = self.store.next_id(IdKind::User);
        if !self.store.reserve_email(email, user_id) {
            return Err(EngineError::AlreadyExists(format!("user with email {email}")));
        }

        let user = User {
            id: user_id,
            email: email.to_string(),
            name: name.to_string(),
        };
        let calendar = Calendar {
            id: self.store.next_id(IdKind::Calendar),
            owner_id: user_id,
            name: "Personal".into(),
        };
        let event = Event::UserCreated {
            user: user.clone(),
            calendar: calendar.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.store.release_email(email, user_id);
            return Err(e);
        }
        self.store.apply_user_created(&user, &calendar);

        count_op("create_user");
        tracing::info!(user_id, calendar_id = calendar.id, "user created");
        Ok(user)
    }

    // ── Slots ────────────────────────────────────────────────

    /// Create a FREE slot `[start, start + duration)` on the user's calendar.
    pub async fn create_slot(
        &self,
        user_id: Id,
        start: Ms,
        duration_minutes: i64,
    ) -> Result<Slot, EngineError> {
        let _commit = self.commit_gate.read().await;
        let cs = self.calendar_for_owner(user_id)?;
        let duration = validate_duration(duration_minutes)?;
        let end = start
            .checked_add(duration)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        let span = validate_order(start, end, "slot")?;

        let mut guard = cs.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("too many slots on calendar"));
        }
        check_no_overlap(&guard, span, None)?;

        let slot = Slot::new(self.store.next_id(IdKind::Slot), guard.calendar.id, span);
        let event = Event::SlotCreated { slot: slot.clone() };
        self.persist_and_apply(&mut guard, &event).await?;

        count_op("create_slot");
        tracing::info!(user_id, slot_id = slot.id, %span, "slot created");
        Ok(slot)
    }

    /// Move a slot to `[new_start, new_end)`. Duration bounds are not re-applied.
    pub async fn modify_slot_times(
        &self,
        user_id: Id,
        slot_id: Id,
        new_start: Ms,
        new_end: Ms,
        expected_version: Option<u64>,
    ) -> Result<Slot, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut guard = self.resolve_slot_write(slot_id).await?;
        ensure_owner(&guard, user_id, slot_id)?;
        let version = match guard.slot(slot_id) {
            Some(slot) => {
                check_version(slot, expected_version)?;
                slot.version
            }
            None => return Err(EngineError::NotFound(Entity::Slot, slot_id)),
        };
        let span = validate_order(new_start, new_end, "slot")?;
        check_no_overlap(&guard, span, Some(slot_id))?;

        let event = Event::SlotRescheduled {
            id: slot_id,
            calendar_id: guard.calendar.id,
            span,
            version: version + 1,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        count_op("modify_slot_times");
        tracing::info!(user_id, slot_id, %span, "slot rescheduled");
        self.slot_snapshot(&guard, slot_id)
    }

    /// Set FREE/BUSY directly. Freeing a slot that carries a meeting is refused.
    pub async fn set_slot_status(
        &self,
        user_id: Id,
        slot_id: Id,
        status: SlotStatus,
        expected_version: Option<u64>,
    ) -> Result<Slot, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut guard = self.resolve_slot_write(slot_id).await?;
        ensure_owner(&guard, user_id, slot_id)?;
        let slot = guard
            .slot(slot_id)
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        check_version(slot, expected_version)?;
        if status == SlotStatus::Free && slot.meeting_id.is_some() {
            return Err(EngineError::OverlapConflict(ConflictReason::MeetingAttached(
                slot_id,
            )));
        }

        let event = Event::SlotStatusChanged {
            id: slot_id,
            calendar_id: guard.calendar.id,
            status,
            version: slot.version + 1,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        count_op("set_slot_status");
        tracing::info!(user_id, slot_id, %status, "slot status changed");
        self.slot_snapshot(&guard, slot_id)
    }

    /// Delete a slot along with any meeting and participants attached to it.
    pub async fn delete_slot(
        &self,
        user_id: Id,
        slot_id: Id,
        expected_version: Option<u64>,
    ) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut guard = self.resolve_slot_write(slot_id).await?;
        ensure_owner(&guard, user_id, slot_id)?;
        let slot = guard
            .slot(slot_id)
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        check_version(slot, expected_version)?;
        let meeting_id = slot.meeting_id;

        let event = Event::SlotDeleted {
            id: slot_id,
            calendar_id: guard.calendar.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        count_op("delete_slot");
        tracing::info!(user_id, slot_id, ?meeting_id, "slot deleted");
        Ok(())
    }

    fn slot_snapshot(&self, cs: &CalendarState, slot_id: Id) -> Result<Slot, EngineError> {
        cs.slot(slot_id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))
    }

    // ── Meetings ─────────────────────────────────────────────

    /// Book a meeting on a FREE slot. The meeting, its participants and the
    /// slot's switch to BUSY are committed as a single record.
    pub async fn schedule_meeting(
        &self,
        user_id: Id,
        slot_id: Id,
        title: &str,
        description: Option<&str>,
        participant_user_ids: &[Id],
        expected_version: Option<u64>,
    ) -> Result<MeetingInfo, EngineError> {
        validate_meeting_request(title, description, participant_user_ids)?;

        let _commit = self.commit_gate.read().await;
        let mut guard = self.resolve_slot_write(slot_id).await?;
        ensure_owner(&guard, user_id, slot_id)?;
        let slot = guard
            .slot(slot_id)
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        check_version(slot, expected_version)?;
        if slot.status == SlotStatus::Busy || slot.meeting_id.is_some() {
            return Err(EngineError::OverlapConflict(ConflictReason::SlotNotFree(
                slot_id,
            )));
        }
        let version = slot.version + 1;

        let attendees = dedupe_preserving_order(participant_user_ids);
        if let Some(&missing) = attendees.iter().find(|&&id| !self.store.contains_user(id)) {
            return Err(EngineError::NotFound(Entity::User, missing));
        }

        let meeting = Meeting {
            id: self.store.next_id(IdKind::Meeting),
            slot_id,
            title: title.to_string(),
            description: description.map(str::to_string),
        };
        let participants: Vec<Participant> = attendees
            .iter()
            .map(|&participant_user_id| Participant {
                id: self.store.next_id(IdKind::Participant),
                meeting_id: meeting.id,
                user_id: participant_user_id,
            })
            .collect();
        let meeting_id = meeting.id;
        let event = Event::MeetingScheduled {
            meeting,
            participants,
            calendar_id: guard.calendar.id,
            version,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        count_op("schedule_meeting");
        tracing::info!(
            user_id,
            slot_id,
            meeting_id,
            participants = attendees.len(),
            "meeting scheduled"
        );
        guard
            .meeting_info(meeting_id)
            .ok_or(EngineError::NotFound(Entity::Meeting, meeting_id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the smallest event list that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = vec![Event::IdsIssued(self.store.watermarks())];
        for user in self.store.users() {
            let Some(cs) = self.store.calendar_for_owner(user.id) else {
                continue;
            };
            let guard = cs.read().await;
            events.push(Event::UserCreated {
                user,
                calendar: guard.calendar.clone(),
            });
            for slot in &guard.slots {
                events.push(Event::SlotCreated { slot: slot.clone() });
                let Some(meeting_id) = slot.meeting_id else {
                    continue;
                };
                if let Some(meeting) = guard.meetings.get(&meeting_id) {
                    events.push(Event::MeetingScheduled {
                        meeting: meeting.clone(),
                        participants: guard.participants.get(&meeting_id).cloned().unwrap_or_default(),
                        calendar_id: guard.calendar.id,
                        version: slot.version,
                    });
                }
            }
        }
        let event_count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(events = event_count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shapes() {
        assert!(validate_email("ada@example.com").is_ok());
        assert!(validate_email("a@b").is_ok());
        for bad in ["", "ada", "@example.com", "ada@", "ada @example.com", "a@b@c"] {
            assert!(
                matches!(validate_email(bad), Err(EngineError::InvalidArgument(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn user_name_shapes() {
        assert!(validate_user_name("Ada Lovelace").is_ok());
        assert!(validate_user_name("   ").is_err());
        assert!(validate_user_name("R2D2").is_err());
        assert!(validate_user_name("Jean-Luc").is_err());
    }

    #[test]
    fn meeting_request_shapes() {
        assert!(validate_meeting_request("Sync", None, &[1]).is_ok());
        assert!(validate_meeting_request("  ", None, &[1]).is_err());
        assert!(validate_meeting_request("Sync", None, &[]).is_err());
        let long = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(validate_meeting_request(&long, None, &[1]).is_err());
        let crowd: Vec<Id> = (0..=MAX_PARTICIPANTS as Id).collect();
        assert!(validate_meeting_request("Sync", None, &crowd).is_err());
    }

    #[test]
    fn dedupe_keeps_first_seen_order() {
        assert_eq!(dedupe_preserving_order(&[5, 5, 6]), vec![5, 6]);
        assert_eq!(dedupe_preserving_order(&[6, 5, 6, 5, 7]), vec![6, 5, 7]);
        assert!(dedupe_preserving_order(&[]).is_empty());
    }
}
