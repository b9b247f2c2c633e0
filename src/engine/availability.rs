use crate::limits::*;
use crate::model::*;

use super::conflict::{SESSION_BUFFER_MS, checked_span};
use super::{Engine, EngineError};

/// Free time for a tutor inside `query`.
///
/// 1. Clamp availability windows to the query and merge them.
/// 2. Subtract every blocking session widened by `buffer` on both sides.
/// 3. Drop gaps shorter than `min_duration`.
///
/// A slot returned here is exactly the set of starts for which `find_conflict`
/// reports nothing, provided the candidate fits inside the slot.
pub fn free_slots(tutor: &TutorState, query: &Span, buffer: Ms, min_duration: Option<Ms>) -> Vec<Span> {
    let mut windows: Vec<Span> = tutor
        .availability
        .iter()
        .filter(|w| w.overlaps(query))
        .map(|w| Span::new(w.start.max(query.start), w.end.min(query.end)))
        .collect();
    windows.sort_by_key(|s| s.start);
    let windows = merge_overlapping(&windows);
    if windows.is_empty() {
        return windows;
    }

    let search = query.padded(buffer);
    let mut busy: Vec<Span> = tutor
        .overlapping(&search)
        .filter(|s| s.blocks_tutor())
        .map(|s| s.span.padded(buffer))
        .collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    let mut free = subtract_intervals(&windows, &busy);
    if let Some(min) = min_duration {
        free.retain(|s| s.duration_ms() >= min);
    }
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
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

/// `base` minus `to_remove`. Both sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

impl Engine {
    /// Slot suggestions: availability windows minus buffered sessions.
    pub async fn available_slots(
        &self,
        tutor_id: &str,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = Span::try_new(start, end)
            .ok_or_else(|| EngineError::validation("slot window end must be after start"))?;
        if query.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("slot window too wide"));
        }
        if let Some(min) = min_duration {
            if min <= 0 {
                return Err(EngineError::validation("min_duration must be positive"));
            }
            let end = query
                .start
                .checked_add(min)
                .ok_or(EngineError::LimitExceeded("min_duration too large"))?;
            checked_span(query.start, end)?;
        }
        let Some(shared) = self.tutor(tutor_id) else {
            return Ok(Vec::new());
        };
        let ts = shared.read().await;
        Ok(free_slots(&ts, &query, SESSION_BUFFER_MS, min_duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::find_conflict;
    use crate::model::fixtures::session;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn tutor(windows: &[(Ms, Ms)], sessions: &[(Ms, Ms)]) -> TutorState {
        let mut ts = TutorState::new("t1");
        for &(s, e) in windows {
            ts.add_availability(Span::new(s, e));
        }
        for &(s, e) in sessions {
            ts.insert_session(session("t1", &["s1"], s, e));
        }
        ts
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let result = subtract_intervals(&base, &[Span::new(200, 300)]);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 250)]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    #[test]
    fn subtract_one_removal_spanning_two_bases() {
        let base = vec![Span::new(0, 100), Span::new(200, 300)];
        let result = subtract_intervals(&base, &[Span::new(50, 250)]);
        assert_eq!(result, vec![Span::new(0, 50), Span::new(250, 300)]);
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_and_adjacent() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(400, 500), Span::new(600, 700)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 500), Span::new(600, 700)]
        );
    }

    // ── free_slots ───────────────────────────────────────

    #[test]
    fn slots_cut_around_buffered_sessions() {
        let ts = tutor(&[(9 * H, 17 * H)], &[(12 * H, 13 * H)]);
        let slots = free_slots(&ts, &Span::new(0, 24 * H), SESSION_BUFFER_MS, None);
        assert_eq!(
            slots,
            vec![Span::new(9 * H, 11 * H + 30 * M), Span::new(13 * H + 30 * M, 17 * H)]
        );
    }

    #[test]
    fn slots_without_availability_are_empty() {
        let ts = tutor(&[], &[]);
        assert!(free_slots(&ts, &Span::new(0, 24 * H), SESSION_BUFFER_MS, None).is_empty());
    }

    #[test]
    fn slots_merge_overlapping_windows_and_clamp() {
        let ts = tutor(&[(8 * H, 12 * H), (10 * H, 14 * H)], &[]);
        let slots = free_slots(&ts, &Span::new(9 * H, 13 * H), SESSION_BUFFER_MS, None);
        assert_eq!(slots, vec![Span::new(9 * H, 13 * H)]);
    }

    #[test]
    fn slots_respect_min_duration() {
        // 10:00-10:30 then buffer; leaves 09:00-09:30 (30m) and 11:00-12:00 (60m)
        let ts = tutor(&[(9 * H, 12 * H)], &[(10 * H, 10 * H + 30 * M)]);
        let slots = free_slots(&ts, &Span::new(0, 24 * H), SESSION_BUFFER_MS, Some(45 * M));
        assert_eq!(slots, vec![Span::new(11 * H, 12 * H)]);
    }

    #[test]
    fn session_outside_query_still_pushes_buffer_in() {
        // session ends at 09:00, query starts at 09:00: first 30 minutes are blocked
        let ts = tutor(&[(8 * H, 12 * H)], &[(8 * H, 9 * H)]);
        let slots = free_slots(&ts, &Span::new(9 * H, 12 * H), SESSION_BUFFER_MS, None);
        assert_eq!(slots, vec![Span::new(9 * H + 30 * M, 12 * H)]);
    }

    #[test]
    fn slot_starts_agree_with_conflict_checker() {
        let ts = tutor(&[(9 * H, 17 * H)], &[(11 * H, 12 * H), (14 * H, 15 * H)]);
        let slots = free_slots(&ts, &Span::new(9 * H, 17 * H), SESSION_BUFFER_MS, None);
        assert_eq!(slots.len(), 3);
        for slot in slots {
            assert!(find_conflict(&ts, &slot, &[], SESSION_BUFFER_MS).is_none());
            let widened = Span::new(slot.start, slot.end + M);
            if slot.end < 17 * H {
                assert!(find_conflict(&ts, &widened, &[], SESSION_BUFFER_MS).is_some());
            }
        }
    }
}
