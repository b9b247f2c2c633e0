use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::applier::{resolve, target_rooms, target_tutors};
use super::builder::required_text;
use super::registry::{check_len, non_blank};
use super::{Engine, EngineError, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
    Clarify,
    Escalate,
}

impl Decision {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "approve" | "approved" => Some(Decision::Approve),
            "reject" | "rejected" => Some(Decision::Reject),
            "clarify" | "request_clarification" => Some(Decision::Clarify),
            "escalate" | "escalated" => Some(Decision::Escalate),
            _ => None,
        }
    }
}

/// One reviewer action. `notes` doubles as the rejection reason and the
/// clarification text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub request_id: Ulid,
    pub decision: Decision,
    pub notes: Option<String>,
    pub location: Option<String>,
}

fn require_reviewer(actor: &Identity, action: &str) -> Result<(), EngineError> {
    if actor.is_reviewer() {
        return Ok(());
    }
    Err(EngineError::Forbidden(format!(
        "{} {} may not {action} change requests",
        actor.role, actor.user_id
    )))
}

fn invalid_state(request: &ChangeRequest, action: &'static str) -> EngineError {
    tracing::debug!("change request {}: refused {action} in {}", request.id, request.status);
    metrics::counter!(observability::REQUEST_TRANSITIONS_TOTAL, "outcome" => "invalid_state").increment(1);
    EngineError::InvalidState {
        entity: EntityKind::ChangeRequest,
        id: request.id,
        status: request.status.as_str(),
        action,
    }
}

fn optional_notes(notes: Option<String>) -> Result<Option<String>, EngineError> {
    let notes = non_blank(notes);
    if let Some(n) = &notes {
        check_len(n, MAX_TEXT_LEN, "review notes too long")?;
    }
    Ok(notes)
}

fn record_transition(from: RequestStatus, request: &ChangeRequest) {
    metrics::counter!(observability::REQUEST_TRANSITIONS_TOTAL, "outcome" => request.status.as_str()).increment(1);
    tracing::info!("change request {}: {from} -> {}", request.id, request.status);
}

impl Engine {
    pub async fn review(&self, actor: &Identity, review: Review) -> Result<ChangeRequest, EngineError> {
        let Review {
            request_id,
            decision,
            notes,
            location,
        } = review;
        match decision {
            Decision::Approve => self.approve_change_request(actor, request_id, notes, location).await,
            Decision::Reject => {
                self.reject_change_request(actor, request_id, notes.as_deref().unwrap_or_default())
                    .await
            }
            Decision::Clarify => {
                self.request_clarification(actor, request_id, notes.as_deref().unwrap_or_default())
                    .await
            }
            Decision::Escalate => self.escalate(actor, request_id, notes).await,
        }
    }

    /// Approve and apply in one step. On any failure the request and every
    /// session it touches are left as they were.
    pub async fn approve_change_request(
        &self,
        actor: &Identity,
        id: Ulid,
        notes: Option<String>,
        location: Option<String>,
    ) -> Result<ChangeRequest, EngineError> {
        require_reviewer(actor, "approve")?;
        let notes = optional_notes(notes)?;
        let location = non_blank(location);
        if let Some(l) = &location {
            check_len(l, MAX_NAME_LEN, "location too long")?;
        }
        let shared = self.request(id)?;

        let _gate = self.write_gate().await;
        let mut request = shared.write().await;
        if !request.status.is_open() {
            return Err(invalid_state(&request, "approve"));
        }
        if request.requires_room() && location.is_none() {
            return Err(EngineError::validation(format!(
                "approving change request {id} needs a room name"
            )));
        }

        let mut guards = self
            .lock(
                &request.touched_sessions(),
                &target_tutors(&request),
                &target_rooms(&request, location.as_deref()),
            )
            .await?;
        let now = self.now();
        let sessions = match resolve(&request, &guards, location.as_deref(), now) {
            Ok(sessions) => sessions,
            Err(e) => {
                if e.kind() == super::ErrorKind::Conflict {
                    metrics::counter!(observability::APPROVAL_CONFLICTS_TOTAL).increment(1);
                }
                tracing::info!("change request {id}: approval failed: {e}");
                return Err(e);
            }
        };
        self.check_covered(&guards, &sessions)?;

        let from = request.status;
        let mut approved = request.clone();
        approved.status = RequestStatus::Approved;
        approved.reviewer = Some(actor.user_id.clone());
        approved.review_notes = notes;
        approved.approved_location = location;
        approved.updated_at = now;
        approved.resolved_at = Some(now);

        self.persist(Event::ChangeApplied {
            request: approved.clone(),
            sessions: sessions.clone(),
        })
        .await?;
        let written = sessions.len();
        for session in sessions {
            self.apply_session(&mut guards, session);
        }
        *request = approved.clone();
        record_transition(from, &approved);
        tracing::debug!("change request {id}: wrote {written} sessions");
        Ok(approved)
    }

    pub async fn reject_change_request(
        &self,
        actor: &Identity,
        id: Ulid,
        reason: &str,
    ) -> Result<ChangeRequest, EngineError> {
        require_reviewer(actor, "reject")?;
        self.transition(id, "reject", |request| {
            if !request.status.is_open() {
                return Err(invalid_state(request, "reject"));
            }
            let reason = required_text(reason, "rejection reason")?;
            request.status = RequestStatus::Rejected;
            request.reviewer = Some(actor.user_id.clone());
            request.review_notes = Some(reason);
            Ok(())
        })
        .await
    }

    pub async fn request_clarification(
        &self,
        actor: &Identity,
        id: Ulid,
        text: &str,
    ) -> Result<ChangeRequest, EngineError> {
        require_reviewer(actor, "question")?;
        self.transition(id, "request clarification on", |request| {
            if request.status != RequestStatus::Pending {
                return Err(invalid_state(request, "request clarification on"));
            }
            let text = required_text(text, "clarification request")?;
            request.status = RequestStatus::ClarificationRequested;
            request.reviewer = Some(actor.user_id.clone());
            request.clarification_request = Some(text);
            request.clarification_response = None;
            Ok(())
        })
        .await
    }

    /// The proposer's answer sends the request back for review.
    pub async fn respond_to_clarification(
        &self,
        actor: &Identity,
        id: Ulid,
        response: &str,
    ) -> Result<ChangeRequest, EngineError> {
        self.transition(id, "respond to", |request| {
            if actor.user_id != request.proposer {
                return Err(EngineError::Forbidden(format!(
                    "only {} may answer questions on change request {id}",
                    request.proposer
                )));
            }
            if request.status != RequestStatus::ClarificationRequested {
                return Err(invalid_state(request, "respond to"));
            }
            let response = required_text(response, "clarification response")?;
            request.status = RequestStatus::Pending;
            request.clarification_response = Some(response);
            Ok(())
        })
        .await
    }

    pub async fn escalate(
        &self,
        actor: &Identity,
        id: Ulid,
        notes: Option<String>,
    ) -> Result<ChangeRequest, EngineError> {
        require_reviewer(actor, "escalate")?;
        let notes = optional_notes(notes)?;
        let escalated = self
            .transition(id, "escalate", |request| {
                if !request.status.is_open() {
                    return Err(invalid_state(request, "escalate"));
                }
                request.status = RequestStatus::Escalated;
                request.reviewer = Some(actor.user_id.clone());
                if notes.is_some() {
                    request.review_notes = notes;
                }
                Ok(())
            })
            .await?;
        let trigger = if actor.role == Role::System { "deadline" } else { "manual" };
        metrics::counter!(observability::ESCALATIONS_TOTAL, "trigger" => trigger).increment(1);
        Ok(escalated)
    }

    /// Escalate every open request whose deadline has passed. Returns how many moved.
    pub async fn escalate_overdue(&self) -> usize {
        let now = self.now();
        let system = Identity::system();
        let mut escalated = 0;
        for id in self.overdue_requests(now).await {
            match self
                .escalate(&system, id, Some("deadline passed without a decision".into()))
                .await
            {
                Ok(_) => escalated += 1,
                // decided while we were sweeping
                Err(EngineError::InvalidState { .. }) => {}
                Err(e) => tracing::warn!("failed to escalate change request {id}: {e}"),
            }
        }
        escalated
    }

    /// Single-record transition: check and edit a copy, journal it, then swap it in.
    async fn transition<F>(&self, id: Ulid, action: &'static str, edit: F) -> Result<ChangeRequest, EngineError>
    where
        F: FnOnce(&mut ChangeRequest) -> Result<(), EngineError>,
    {
        let shared = self.request(id)?;
        let _gate = self.write_gate().await;
        let mut request = shared.write().await;

        let from = request.status;
        let mut updated = request.clone();
        edit(&mut updated)?;
        let now = self.now();
        updated.updated_at = now;
        if !updated.status.is_open() {
            updated.resolved_at = Some(now);
        }
        self.persist(Event::RequestUpserted {
            request: updated.clone(),
        })
        .await?;
        *request = updated.clone();
        record_transition(from, &updated);
        tracing::debug!("change request {id}: {action} journaled");
        Ok(updated)
    }
}
