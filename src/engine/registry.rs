use std::collections::{BTreeSet, HashSet};

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::checked_span;
use super::{Engine, EngineError, EntityKind};

/// Booking input. Sessions always start `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub id: Option<Ulid>,
    pub tutor_id: String,
    pub student_ids: Vec<String>,
    pub subject: String,
    pub start: Ms,
    pub end: Ms,
    pub mode: Mode,
    pub location: Option<String>,
    pub meeting_link: Option<String>,
    pub equipment: BTreeSet<Equipment>,
    pub class_id: Option<String>,
    pub notes: Option<String>,
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// Trimmed, non-empty, duplicate-free, order kept.
fn normalize_students(ids: Vec<String>) -> Result<Vec<String>, EngineError> {
    if ids.is_empty() {
        return Err(EngineError::validation("a session needs at least one student"));
    }
    if ids.len() > MAX_STUDENTS_PER_SESSION {
        return Err(EngineError::LimitExceeded("too many students in session"));
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(EngineError::validation("student id must not be empty"));
        }
        check_len(&id, MAX_NAME_LEN, "student id too long")?;
        if !seen.insert(id.clone()) {
            return Err(EngineError::validation(format!("student {id} listed twice")));
        }
        out.push(id);
    }
    Ok(out)
}

/// Location / meeting-link requirement of a confirmed session.
pub(crate) fn check_placement_fields(session: &Session) -> Result<(), EngineError> {
    match session.mode {
        Mode::Offline if session.location.as_deref().is_none_or(|l| l.trim().is_empty()) => Err(
            EngineError::validation("an offline session needs a location before it is confirmed"),
        ),
        Mode::Online if session.meeting_link.as_deref().is_none_or(|l| l.trim().is_empty()) => Err(
            EngineError::validation("an online session needs a meeting link before it is confirmed"),
        ),
        _ => Ok(()),
    }
}

fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
    )
}

fn may_manage_session(actor: &Identity, tutor_id: &str) -> bool {
    actor.is_reviewer() || (actor.role == Role::Tutor && actor.user_id == tutor_id)
}

impl Engine {
    pub async fn create_session(&self, actor: &Identity, new: NewSession) -> Result<Session, EngineError> {
        let tutor_id = new.tutor_id.trim().to_string();
        if tutor_id.is_empty() {
            return Err(EngineError::validation("tutor id is required"));
        }
        check_len(&tutor_id, MAX_NAME_LEN, "tutor id too long")?;
        let student_ids = normalize_students(new.student_ids)?;

        let allowed = match actor.role {
            Role::Management | Role::System => true,
            Role::Tutor => actor.user_id == tutor_id,
            Role::Student => student_ids.contains(&actor.user_id),
            Role::Optimizer => false,
        };
        if !allowed {
            return Err(EngineError::Forbidden(format!(
                "{} {} may not book this session",
                actor.role, actor.user_id
            )));
        }

        let subject = new.subject.trim().to_string();
        if subject.is_empty() {
            return Err(EngineError::validation("subject is required"));
        }
        check_len(&subject, MAX_NAME_LEN, "subject too long")?;
        let span = checked_span(new.start, new.end)?;
        if new.mode == Mode::Online && !new.equipment.is_empty() {
            return Err(EngineError::validation("equipment requirements apply to offline sessions only"));
        }
        let notes = non_blank(new.notes);
        if let Some(n) = &notes {
            check_len(n, MAX_TEXT_LEN, "notes too long")?;
        }
        let location = non_blank(new.location);
        let meeting_link = non_blank(new.meeting_link);
        for v in location.iter().chain(meeting_link.iter()) {
            check_len(v, MAX_NAME_LEN, "location too long")?;
        }

        let id = new.id.unwrap_or_else(Ulid::new);
        let session = Session {
            id,
            tutor_id: tutor_id.clone(),
            student_ids,
            subject,
            span,
            mode: new.mode,
            location,
            meeting_link,
            status: SessionStatus::Pending,
            equipment: new.equipment,
            class_id: non_blank(new.class_id),
            notes,
            group_limit: None,
            split_from: None,
            merged_from: Vec::new(),
            superseded_by: None,
        };

        let _gate = self.write_gate().await;
        self.tutor_or_create(&tutor_id);
        let rooms: Vec<String> = session.occupied_room().map(str::to_string).into_iter().collect();
        let mut guards = self.lock(&[], &[tutor_id.clone()], &rooms).await?;
        if self.session_to_tutor.contains_key(&id) {
            return Err(EngineError::validation(format!("session {id} already exists")));
        }
        if guards.tutors[&tutor_id].sessions.len() >= MAX_SESSIONS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many sessions for tutor"));
        }

        self.persist(Event::SessionUpserted { session: session.clone() }).await?;
        self.apply_session(&mut guards, session.clone());
        tracing::info!("session {id} booked for tutor {tutor_id} ({})", session.mode);
        Ok(session)
    }

    /// Status changes driven by the owning tutor: confirm, complete, cancel.
    pub async fn transition_session(
        &self,
        actor: &Identity,
        id: Ulid,
        to: SessionStatus,
    ) -> Result<Session, EngineError> {
        let _gate = self.write_gate().await;
        let mut guards = self.lock(&[id], &[], &[]).await?;
        let current = guards
            .session(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(EntityKind::Session, id))?;

        if !may_manage_session(actor, &current.tutor_id) {
            return Err(EngineError::Forbidden(format!(
                "{} {} does not own session {id}",
                actor.role, actor.user_id
            )));
        }
        if !transition_allowed(current.status, to) {
            tracing::debug!("session {id}: refused {} -> {to}", current.status);
            return Err(EngineError::InvalidState {
                entity: EntityKind::Session,
                id,
                status: current.status.as_str(),
                action: match to {
                    SessionStatus::Pending => "reopen",
                    SessionStatus::Confirmed => "confirm",
                    SessionStatus::Completed => "complete",
                    SessionStatus::Cancelled => "cancel",
                },
            });
        }

        let mut updated = current.clone();
        updated.status = to;
        if to == SessionStatus::Confirmed {
            check_placement_fields(&updated)?;
        }

        self.persist(Event::SessionUpserted { session: updated.clone() }).await?;
        self.apply_session(&mut guards, updated.clone());
        tracing::info!("session {id}: {} -> {to}", current.status);
        Ok(updated)
    }

    pub async fn add_availability(
        &self,
        actor: &Identity,
        tutor_id: &str,
        start: Ms,
        end: Ms,
    ) -> Result<(), EngineError> {
        let tutor_id = tutor_id.trim();
        if tutor_id.is_empty() {
            return Err(EngineError::validation("tutor id is required"));
        }
        check_len(tutor_id, MAX_NAME_LEN, "tutor id too long")?;
        if !may_manage_session(actor, tutor_id) {
            return Err(EngineError::Forbidden(format!(
                "{} {} may not edit availability of {tutor_id}",
                actor.role, actor.user_id
            )));
        }
        let span = Span::try_new(start, end)
            .ok_or_else(|| EngineError::validation("availability end must be after start"))?;
        if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if span.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("availability window too wide"));
        }

        let _gate = self.write_gate().await;
        let shared = self.tutor_or_create(tutor_id);
        let mut ts = shared.write().await;
        self.persist(Event::AvailabilityAdded {
            tutor_id: tutor_id.to_string(),
            span,
        })
        .await?;
        ts.add_availability(span);
        Ok(())
    }
}
