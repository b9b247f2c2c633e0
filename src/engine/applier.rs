use std::collections::{BTreeMap, HashSet};

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{SESSION_BUFFER_MS, room_conflict, tutor_conflict, validate_span};
use super::{EngineError, EntityKind, Guards};

/// Resolve an approved request into the sessions it writes.
///
/// Works on copies only: nothing under `guards` changes here. Entries apply
/// in order, and each one sees the effect of the previous ones.
pub(super) fn resolve(
    request: &ChangeRequest,
    guards: &Guards,
    approval_room: Option<&str>,
    now: Ms,
) -> Result<Vec<Session>, EngineError> {
    let mut work = Working::new(guards);
    match &request.payload {
        RequestPayload::SessionChange {
            session_id, change, ..
        } => match change {
            SessionChange::Duration(d) => work.reschedule(*session_id, d.new_span, approval_room)?,
            SessionChange::Location(l) => work.relocate(*session_id, l, approval_room)?,
            SessionChange::Type(TypeChange::Merge { session_ids }) => work.merge(session_ids)?,
            SessionChange::Type(TypeChange::Split { into }) => work.split(*session_id, *into)?,
        },
        RequestPayload::ResourceAllocation { changes } => {
            for (i, change) in changes.iter().enumerate() {
                work.allocate(change, approval_room, now).map_err(|e| match e {
                    EngineError::Validation(msg) => EngineError::Validation(format!("change #{}: {msg}", i + 1)),
                    other => other,
                })?;
            }
        }
    }
    Ok(work.into_sessions())
}

/// Tutors a request may move sessions to. They must be locked before resolving.
pub(super) fn target_tutors(request: &ChangeRequest) -> Vec<String> {
    match &request.payload {
        RequestPayload::ResourceAllocation { changes } => changes
            .iter()
            .filter(|c| c.kind == AllocationKind::ReassignTutor)
            .map(|c| c.to.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        RequestPayload::SessionChange { .. } => Vec::new(),
    }
}

/// Rooms a request may place sessions into.
pub(super) fn target_rooms(request: &ChangeRequest, approval_room: Option<&str>) -> Vec<String> {
    let mut rooms: Vec<String> = approval_room.map(str::to_string).into_iter().collect();
    if let RequestPayload::SessionChange {
        change: SessionChange::Location(LocationChange { location: Some(l), .. }),
        ..
    } = &request.payload
    {
        rooms.push(l.trim().to_string());
    }
    rooms
}

struct Working<'g> {
    guards: &'g Guards,
    sessions: BTreeMap<Ulid, Session>,
}

impl<'g> Working<'g> {
    fn new(guards: &'g Guards) -> Self {
        Self {
            guards,
            sessions: BTreeMap::new(),
        }
    }

    /// Current working copy, loaded from the locked state on first touch.
    fn load(&mut self, id: Ulid) -> Result<Session, EngineError> {
        if let Some(s) = self.sessions.get(&id) {
            return Ok(s.clone());
        }
        self.guards
            .session(id)
            .cloned()
            .ok_or(EngineError::ConcurrentModification(id))
    }

    fn load_active(&mut self, id: Ulid) -> Result<Session, EngineError> {
        let session = self.load(id)?;
        if !session.status.is_active() {
            return Err(EngineError::InvalidState {
                entity: EntityKind::Session,
                id,
                status: session.status.as_str(),
                action: "apply a change to",
            });
        }
        Ok(session)
    }

    fn store(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    fn into_sessions(self) -> Vec<Session> {
        self.sessions.into_values().collect()
    }

    /// Stored copies of anything we hold a working copy of are stale.
    fn stale_ids(&self) -> Vec<Ulid> {
        self.sessions.keys().copied().collect()
    }

    fn check_tutor(&self, session: &Session) -> Result<(), EngineError> {
        if !session.blocks_tutor() {
            return Ok(());
        }
        let ts = self
            .guards
            .tutors
            .get(&session.tutor_id)
            .ok_or(EngineError::ConcurrentModification(session.id))?;
        let mut exclude = self.stale_ids();
        exclude.push(session.id);
        tutor_conflict(ts, &session.span, &exclude)?;

        let padded = session.span.padded(SESSION_BUFFER_MS);
        if let Some(other) = self.sessions.values().find(|o| {
            o.id != session.id && o.tutor_id == session.tutor_id && o.blocks_tutor() && o.span.overlaps(&padded)
        }) {
            return Err(EngineError::Conflict {
                on: format!("tutor {}", session.tutor_id),
                with: other.id,
                span: other.span,
            });
        }
        Ok(())
    }

    /// Capacity, equipment and occupancy of `room` for `session` as it will be.
    fn check_room(&self, session: &Session, room: &str) -> Result<(), EngineError> {
        let rs = self
            .guards
            .rooms
            .get(room)
            .ok_or_else(|| EngineError::not_found(EntityKind::Room, room))?;
        let students = session.student_ids.len();
        if students > rs.room.capacity as usize {
            return Err(EngineError::validation(format!(
                "room {room} seats {} but session {} has {students} students",
                rs.room.capacity, session.id
            )));
        }
        let missing = rs.room.missing_equipment(&session.equipment);
        if !missing.is_empty() {
            let missing: Vec<_> = missing.iter().map(Equipment::as_str).collect();
            return Err(EngineError::validation(format!(
                "room {room} lacks {}",
                missing.join(", ")
            )));
        }

        let mut exclude = self.stale_ids();
        exclude.push(session.id);
        room_conflict(rs, &session.span, &exclude)?;
        if let Some(other) = self
            .sessions
            .values()
            .find(|o| o.id != session.id && o.occupied_room() == Some(room) && o.span.overlaps(&session.span))
        {
            return Err(EngineError::Conflict {
                on: format!("room {room}"),
                with: other.id,
                span: other.span,
            });
        }
        Ok(())
    }

    /// Put `session` in `room`: offline, located there, checked against the directory.
    fn place(&self, session: &mut Session, room: &str) -> Result<(), EngineError> {
        session.mode = Mode::Offline;
        session.location = Some(room.to_string());
        session.meeting_link = None;
        self.check_room(session, room)
    }

    /// Re-check the room a session keeps, when the directory knows it.
    fn recheck_current_room(&self, session: &Session) -> Result<(), EngineError> {
        match session.occupied_room() {
            Some(room) if self.guards.rooms.contains_key(room) => self.check_room(session, room),
            _ => Ok(()),
        }
    }

    fn reschedule(&mut self, id: Ulid, new_span: Span, approval_room: Option<&str>) -> Result<(), EngineError> {
        let mut session = self.load_active(id)?;
        session.span = new_span;
        self.check_tutor(&session)?;
        if session.is_offline() {
            match approval_room {
                Some(room) => self.place(&mut session, room)?,
                None => self.recheck_current_room(&session)?,
            }
        }
        self.store(session);
        Ok(())
    }

    fn relocate(&mut self, id: Ulid, change: &LocationChange, approval_room: Option<&str>) -> Result<(), EngineError> {
        let mut session = self.load_active(id)?;
        if change.online {
            session.mode = Mode::Online;
            session.meeting_link = change.meeting_link.clone();
            session.location = None;
            session.equipment.clear();
        } else {
            let room = approval_room
                .or(change.location.as_deref())
                .ok_or_else(|| EngineError::validation("a move offline needs a room"))?
                .to_string();
            self.place(&mut session, &room)?;
        }
        self.store(session);
        Ok(())
    }

    fn merge(&mut self, ids: &[Ulid]) -> Result<(), EngineError> {
        let (&survivor_id, rest) = ids
            .split_first()
            .ok_or_else(|| EngineError::validation("a merge needs at least two sessions"))?;
        let mut survivor = self.load_active(survivor_id)?;
        if survivor.was_merged() {
            return Err(EngineError::validation(format!("session {survivor_id} was already merged")));
        }

        let mut seen: HashSet<String> = survivor.student_ids.iter().cloned().collect();
        let mut absorbed = Vec::with_capacity(rest.len());
        for &id in rest {
            let mut other = self.load_active(id)?;
            if other.was_merged()
                || other.tutor_id != survivor.tutor_id
                || other.subject != survivor.subject
                || other.span != survivor.span
            {
                return Err(EngineError::validation(format!(
                    "session {id} can no longer be merged into {survivor_id}"
                )));
            }
            for student in &other.student_ids {
                if seen.insert(student.clone()) {
                    survivor.student_ids.push(student.clone());
                }
            }
            survivor.equipment.extend(other.equipment.iter().copied());
            other.status = SessionStatus::Cancelled;
            other.superseded_by = Some(survivor_id);
            absorbed.push(other);
        }

        if survivor.student_ids.len() > MAX_STUDENTS_PER_SESSION {
            return Err(EngineError::LimitExceeded("too many students in session"));
        }
        if let Some(limit) = survivor.group_limit
            && survivor.student_ids.len() > limit as usize
        {
            return Err(EngineError::validation(format!(
                "merged group of {} exceeds the group limit {limit}",
                survivor.student_ids.len()
            )));
        }
        survivor.merged_from = absorbed.iter().map(|s| s.id).collect();
        for other in absorbed {
            self.store(other);
        }
        self.recheck_current_room(&survivor)?;
        self.store(survivor);
        Ok(())
    }

    fn split(&mut self, id: Ulid, into: u32) -> Result<(), EngineError> {
        let mut source = self.load_active(id)?;
        if !source.is_group() || source.student_ids.len() != into as usize {
            return Err(EngineError::validation(format!(
                "session {id} now has {} students; cannot split into {into}",
                source.student_ids.len()
            )));
        }
        let ts = self
            .guards
            .tutors
            .get(&source.tutor_id)
            .ok_or(EngineError::ConcurrentModification(id))?;
        if ts.sessions.len() + source.student_ids.len() > MAX_SESSIONS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many sessions for tutor"));
        }

        for student in &source.student_ids {
            self.store(Session {
                id: Ulid::new(),
                student_ids: vec![student.clone()],
                group_limit: None,
                split_from: Some(id),
                merged_from: Vec::new(),
                superseded_by: None,
                ..source.clone()
            });
        }
        source.status = SessionStatus::Cancelled;
        self.store(source);
        Ok(())
    }

    fn allocate(&mut self, change: &AllocationChange, approval_room: Option<&str>, now: Ms) -> Result<(), EngineError> {
        let mut session = self.load_active(change.resource_id)?;
        let to = change.to.trim();
        match change.kind {
            AllocationKind::ReallocateRoom => {
                if !session.is_offline() {
                    return Err(EngineError::validation(format!(
                        "session {} is online; no room to reallocate",
                        session.id
                    )));
                }
                let room = approval_room.ok_or_else(|| EngineError::validation("a room reallocation needs a room"))?;
                self.place(&mut session, room)?;
            }
            AllocationKind::ReassignTutor => {
                if to.is_empty() {
                    return Err(EngineError::validation("reassign_tutor needs a target tutor"));
                }
                if to == session.tutor_id {
                    return Err(EngineError::validation(format!("session {} is already with {to}", session.id)));
                }
                let target = self
                    .guards
                    .tutors
                    .get(to)
                    .ok_or_else(|| EngineError::not_found(EntityKind::Tutor, to))?;
                if target.sessions.len() >= MAX_SESSIONS_PER_TUTOR {
                    return Err(EngineError::LimitExceeded("too many sessions for tutor"));
                }
                session.tutor_id = to.to_string();
                self.check_tutor(&session)?;
            }
            AllocationKind::AdjustGroupSize => {
                let limit: u32 = to
                    .parse()
                    .map_err(|_| EngineError::validation(format!("group size {to:?} is not a number")))?;
                if (limit as usize) < session.student_ids.len() || limit as usize > MAX_STUDENTS_PER_SESSION {
                    return Err(EngineError::validation(format!(
                        "group size {limit} must cover the {} enrolled students",
                        session.student_ids.len()
                    )));
                }
                session.group_limit = Some(limit);
            }
            AllocationKind::AdjustSchedule => {
                let start = parse_instant(to)
                    .ok_or_else(|| EngineError::validation(format!("{to:?} is not an instant")))?;
                if start <= now + MIN_RESCHEDULE_LEAD_MS {
                    return Err(EngineError::validation("new start time must be more than a minute from now"));
                }
                let span = Span::new(start, start + session.span.duration_ms());
                validate_span(&span)?;
                session.span = span;
                self.check_tutor(&session)?;
                self.recheck_current_room(&session)?;
            }
        }
        self.store(session);
        Ok(())
    }
}
