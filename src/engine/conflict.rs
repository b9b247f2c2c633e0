use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Idle time required between two sessions of the same tutor.
pub const SESSION_BUFFER_MS: Ms = 30 * MINUTE_MS;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SESSION_DURATION_MS {
        return Err(EngineError::LimitExceeded("session longer than a day"));
    }
    Ok(())
}

pub(crate) fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end)
        .ok_or_else(|| EngineError::validation(format!("end {end} must be after start {start}")))?;
    validate_span(&span)?;
    Ok(span)
}

/// First blocking session of the tutor whose buffered interval overlaps `candidate`.
///
/// Each existing session is widened by `buffer` on both sides. Intervals are
/// half-open, so a candidate starting exactly at `end + buffer` does not collide.
/// The binary search over the sorted session list replaces a calendar-date
/// pre-filter: only sessions starting before `candidate.end + buffer` are visited.
pub fn find_conflict(
    tutor: &TutorState,
    candidate: &Span,
    exclude: &[Ulid],
    buffer: Ms,
) -> Option<ConflictReport> {
    let window = candidate.padded(buffer);
    tutor
        .overlapping(&window)
        .filter(|s| s.blocks_tutor() && !exclude.contains(&s.id))
        .find(|s| s.span.padded(buffer).overlaps(candidate))
        .map(|s| ConflictReport {
            session_id: s.id,
            span: s.span,
        })
}

pub(crate) fn tutor_conflict(
    tutor: &TutorState,
    candidate: &Span,
    exclude: &[Ulid],
) -> Result<(), EngineError> {
    match find_conflict(tutor, candidate, exclude, SESSION_BUFFER_MS) {
        Some(c) => Err(EngineError::Conflict {
            on: format!("tutor {}", tutor.tutor_id),
            with: c.session_id,
            span: c.span,
        }),
        None => Ok(()),
    }
}

/// Room occupancy check. Rooms need no buffer, only a free interval.
pub(crate) fn room_conflict(
    room: &RoomState,
    candidate: &Span,
    exclude: &[Ulid],
) -> Result<(), EngineError> {
    match room
        .overlapping(candidate)
        .find(|o| !exclude.contains(&o.session_id))
    {
        Some(o) => Err(EngineError::Conflict {
            on: format!("room {}", room.room.name),
            with: o.session_id,
            span: o.span,
        }),
        None => Ok(()),
    }
}

impl Engine {
    /// Whether `[start, end)` collides with any of the tutor's sessions,
    /// ignoring `exclude`. A tutor with no sessions never conflicts.
    pub async fn has_conflict(
        &self,
        tutor_id: &str,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Option<ConflictReport>, EngineError> {
        let span = checked_span(start, end)?;
        let Some(shared) = self.tutor(tutor_id) else {
            return Ok(None);
        };
        let ts = shared.read().await;
        let exclude: Vec<Ulid> = exclude.into_iter().collect();
        Ok(find_conflict(&ts, &span, &exclude, SESSION_BUFFER_MS))
    }
}
