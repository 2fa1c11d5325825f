use std::cmp::Ordering;

use crate::limits::*;
use crate::model::*;

use super::availability::{Buckets, bucketize, busy_spans, complement, merge_overlapping};
use super::conflict::{ensure_owner, validate_order, validate_window};
use super::{Engine, EngineError, Entity};

fn compare_slots(a: &Slot, b: &Slot, sort: SlotSort, direction: SortDirection) -> Ordering {
    let primary = match sort {
        SlotSort::Start => a.span.start.cmp(&b.span.start),
        SlotSort::End => a.span.end.cmp(&b.span.end),
        SlotSort::Status => a.status.as_str().cmp(b.status.as_str()),
        SlotSort::Id => a.id.cmp(&b.id),
    };
    let primary = match direction {
        SortDirection::Asc => primary,
        SortDirection::Desc => primary.reverse(),
    };
    // Ties always break by ascending id.
    primary.then(a.id.cmp(&b.id))
}

fn paginate<T>(items: Vec<T>, req: &PageRequest) -> Page<T> {
    let total_items = items.len();
    let total_pages = total_items.div_ceil(req.size);
    let items = items
        .into_iter()
        .skip(req.page.saturating_mul(req.size))
        .take(req.size)
        .collect();
    Page {
        items,
        page: req.page,
        size: req.size,
        total_items,
        total_pages,
    }
}

impl Engine {
    /// Busy and free intervals of the user's calendar within `[from, to)`.
    ///
    /// Only slots whose start lies inside the window are considered, so a BUSY
    /// slot that began before `from` leaves no mark. Busy intervals are
    /// reported unclipped.
    pub async fn free_busy(&self, user_id: Id, from: Ms, to: Ms) -> Result<FreeBusy, EngineError> {
        let cs = self.calendar_for_owner(user_id)?;
        let window = validate_window(from, to)?;
        let guard = cs.read().await;

        let busy = merge_overlapping(&busy_spans(guard.starting_within(window)));
        let free = complement(window.start, window.end, &busy);

        tracing::debug!(
            user_id,
            %window,
            busy = busy.len(),
            free = free.len(),
            "free/busy computed"
        );
        Ok(FreeBusy { busy, free })
    }

    /// Slice `[from, to)` into `bucket_ms` pieces. Pure time slicing: slot
    /// occupancy is not consulted and the user's calendar is not looked up.
    pub fn bucketed_availability(
        &self,
        user_id: Id,
        from: Ms,
        to: Ms,
        bucket_ms: Ms,
    ) -> Result<Buckets, EngineError> {
        validate_window(from, to)?;
        let buckets = bucketize(from, to, bucket_ms).ok_or_else(|| {
            EngineError::InvalidArgument("bucket length must be positive".into())
        })?;
        if buckets.len() > MAX_BUCKETS {
            return Err(EngineError::LimitExceeded("too many buckets"));
        }
        tracing::debug!(user_id, from, to, bucket_ms, buckets = buckets.len(), "buckets computed");
        Ok(buckets)
    }

    /// Page through the user's slots starting in `[from, to)`.
    pub async fn query_slots(
        &self,
        user_id: Id,
        from: Ms,
        to: Ms,
        status: Option<SlotStatus>,
        page: PageRequest,
    ) -> Result<Page<Slot>, EngineError> {
        let cs = self.calendar_for_owner(user_id)?;
        let window = validate_order(from, to, "window")?;
        if page.size == 0 || page.size > MAX_PAGE_SIZE {
            return Err(EngineError::InvalidArgument(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let mut slots: Vec<Slot> = {
            let guard = cs.read().await;
            guard
                .starting_within(window)
                .iter()
                .filter(|s| status.is_none_or(|st| s.status == st))
                .cloned()
                .collect()
        };
        slots.sort_by(|a, b| compare_slots(a, b, page.sort, page.direction));
        Ok(paginate(slots, &page))
    }

    pub async fn get_slot(&self, user_id: Id, slot_id: Id) -> Result<Slot, EngineError> {
        let cs = self
            .store
            .calendar_for_slot(slot_id)
            .and_then(|calendar_id| self.store.get_calendar(calendar_id))
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        let guard = cs.read().await;
        let slot = guard
            .slot(slot_id)
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        ensure_owner(&guard, user_id, slot_id)?;
        Ok(slot.clone())
    }

    /// Every user, ordered by id.
    pub fn list_users(&self) -> Vec<User> {
        self.store.users()
    }

    pub fn get_user(&self, user_id: Id) -> Result<User, EngineError> {
        self.store
            .get_user(user_id)
            .ok_or(EngineError::NotFound(Entity::User, user_id))
    }
}
