use crate::model::*;

// ── Interval Algebra ──────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
///
/// An interval folds into the previous one unless it starts strictly after
/// the previous end, so touching intervals merge.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Free gaps of `[window_start, window_end)` around merged busy intervals.
///
/// Busy intervals are walked in order with a cursor; they are not clipped to
/// the window, so a busy interval running past `window_end` leaves no trailing gap.
pub fn complement(window_start: Ms, window_end: Ms, merged_busy: &[Span]) -> Vec<Span> {
    let mut free = Vec::new();
    let mut cursor = window_start;

    for busy in merged_busy {
        if busy.start > cursor {
            free.push(Span::new(cursor, busy.start));
        }
        cursor = cursor.max(busy.end);
    }

    if cursor < window_end {
        free.push(Span::new(cursor, window_end));
    }

    free
}

/// Fixed-size slicing of a window. Cheap to copy; every call to
/// [`Buckets::iter`] starts again from the first bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buckets {
    window: Span,
    step: Ms,
}

/// Slice `[from, to)` into consecutive `step`-long buckets, the last one
/// clipped to `to`. Returns `None` for a non-positive step.
pub fn bucketize(from: Ms, to: Ms, step: Ms) -> Option<Buckets> {
    if step <= 0 {
        return None;
    }
    Some(Buckets {
        window: Span { start: from, end: to },
        step,
    })
}

impl Buckets {
    pub fn iter(&self) -> BucketIter {
        BucketIter {
            cursor: self.window.start,
            end: self.window.end,
            step: self.step,
        }
    }

    pub fn len(&self) -> usize {
        let width = self.window.end - self.window.start;
        if width <= 0 {
            return 0;
        }
        // Ceiling division without overflow for large widths.
        (width / self.step + i64::from(width % self.step != 0)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IntoIterator for &Buckets {
    type Item = Span;
    type IntoIter = BucketIter;

    fn into_iter(self) -> BucketIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct BucketIter {
    cursor: Ms,
    end: Ms,
    step: Ms,
}

impl Iterator for BucketIter {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        if self.cursor >= self.end {
            return None;
        }
        let bucket_end = self.cursor.saturating_add(self.step).min(self.end);
        let bucket = Span::new(self.cursor, bucket_end);
        self.cursor = bucket_end;
        Some(bucket)
    }
}

/// BUSY slots as spans, sorted by start. Input order is not assumed.
pub fn busy_spans<'a>(slots: impl IntoIterator<Item = &'a Slot>) -> Vec<Span> {
    let mut busy: Vec<Span> = slots
        .into_iter()
        .filter(|s| s.status == SlotStatus::Busy)
        .map(|s| s.span)
        .collect();
    busy.sort_by_key(|s| s.start);
    busy
}
