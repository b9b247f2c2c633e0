use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::checked_span;
use super::registry::{check_len, non_blank};
use super::{Engine, EngineError, EntityKind};

/// Proposer intent for a `session_change`, one variant per `changeType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeInput {
    Duration {
        new_start: Ms,
        new_end: Ms,
        new_duration_minutes: i64,
    },
    Location {
        online: bool,
        location: Option<String>,
        meeting_link: Option<String>,
    },
    Type {
        new_type: String,
        merge_session_ids: Vec<Ulid>,
        split_into: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChangeRequest {
    pub id: Option<Ulid>,
    pub kind: RequestKind,
    pub target_id: Option<Ulid>,
    pub change: Option<ChangeInput>,
    pub allocation: Vec<AllocationChange>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Priority,
    pub deadline: Option<Ms>,
}

impl NewChangeRequest {
    pub fn session_change(target: Ulid, change: ChangeInput, description: &str) -> Self {
        Self {
            id: None,
            kind: RequestKind::SessionChange,
            target_id: Some(target),
            change: Some(change),
            allocation: Vec::new(),
            title: None,
            description: Some(description.to_string()),
            priority: Priority::default(),
            deadline: None,
        }
    }

    pub fn resource_allocation(changes: Vec<AllocationChange>, description: Option<&str>) -> Self {
        Self {
            id: None,
            kind: RequestKind::ResourceAllocation,
            target_id: None,
            change: None,
            allocation: changes,
            title: None,
            description: description.map(str::to_string),
            priority: Priority::default(),
            deadline: None,
        }
    }
}

// ── JSON payloads ────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum InstantLit {
    Millis(i64),
    Text(String),
}

impl InstantLit {
    fn resolve(self, field: &str) -> Result<Ms, EngineError> {
        match self {
            InstantLit::Millis(ms) => Ok(ms),
            InstantLit::Text(text) => parse_instant(&text)
                .ok_or_else(|| EngineError::validation(format!("{field}: unrecognised instant {text:?}"))),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DurationData {
    new_start_time: InstantLit,
    new_end_time: InstantLit,
    new_duration: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationData {
    new_is_online: bool,
    #[serde(default)]
    new_location: Option<String>,
    #[serde(default)]
    new_meeting_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeData {
    new_type: String,
    #[serde(default)]
    merge_session_ids: Vec<String>,
    #[serde(default)]
    split_into: Option<u32>,
}

fn decode<T: for<'de> Deserialize<'de>>(change_type: &str, data: &Value) -> Result<T, EngineError> {
    serde_json::from_value(data.clone())
        .map_err(|e| EngineError::validation(format!("{change_type} payload: {e}")))
}

impl ChangeInput {
    /// Decode a `changeData` object according to its `changeType` tag.
    pub fn from_json(change_type: &str, data: &Value) -> Result<Self, EngineError> {
        match change_type.trim().to_lowercase().as_str() {
            "change_duration" => {
                let d: DurationData = decode(change_type, data)?;
                Ok(ChangeInput::Duration {
                    new_start: d.new_start_time.resolve("newStartTime")?,
                    new_end: d.new_end_time.resolve("newEndTime")?,
                    new_duration_minutes: d.new_duration,
                })
            }
            "change_location" => {
                let d: LocationData = decode(change_type, data)?;
                Ok(ChangeInput::Location {
                    online: d.new_is_online,
                    location: d.new_location,
                    meeting_link: d.new_meeting_link,
                })
            }
            "change_type" => {
                let d: TypeData = decode(change_type, data)?;
                let merge_session_ids = d
                    .merge_session_ids
                    .iter()
                    .map(|s| {
                        Ulid::from_string(s.trim())
                            .map_err(|e| EngineError::validation(format!("mergeSessionIds: bad id {s:?}: {e}")))
                    })
                    .collect::<Result<_, _>>()?;
                Ok(ChangeInput::Type {
                    new_type: d.new_type,
                    merge_session_ids,
                    split_into: d.split_into,
                })
            }
            other => Err(EngineError::validation(format!("unknown change type {other:?}"))),
        }
    }
}

/// Accepts a bare array of changes or `{"changes": [...]}`.
pub fn allocation_changes_from_json(data: &Value) -> Result<Vec<AllocationChange>, EngineError> {
    let list = match data {
        Value::Object(map) => map
            .get("changes")
            .ok_or_else(|| EngineError::validation("resource allocation payload needs a changes list"))?,
        other => other,
    };
    serde_json::from_value(list.clone())
        .map_err(|e| EngineError::validation(format!("resource allocation changes: {e}")))
}

// ── Validation ───────────────────────────────────────────────────

fn text_min(value: Option<&str>, what: &str) -> Result<String, EngineError> {
    let text = value.map(str::trim).unwrap_or_default();
    if text.chars().count() < MIN_TEXT_LEN {
        return Err(EngineError::validation(format!(
            "{what} must be at least {MIN_TEXT_LEN} characters"
        )));
    }
    check_len(text, MAX_TEXT_LEN, "text too long")?;
    Ok(text.to_string())
}

pub(crate) fn required_text(value: &str, what: &str) -> Result<String, EngineError> {
    text_min(Some(value), what)
}

fn parse_new_type(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "merge" | "group" => Some(true),
        "split" | "individual" => Some(false),
        _ => None,
    }
}

/// Same tutor, subject and interval, still active, not merged before.
fn check_mergeable(target: &Session, other: &Session) -> Result<(), EngineError> {
    if !other.status.is_active() {
        return Err(EngineError::validation(format!(
            "session {} is {} and cannot be merged",
            other.id, other.status
        )));
    }
    if other.was_merged() {
        return Err(EngineError::validation(format!("session {} was already merged", other.id)));
    }
    if other.tutor_id != target.tutor_id || other.subject != target.subject || other.span != target.span {
        return Err(EngineError::validation(format!(
            "session {} differs from {} in tutor, subject or time",
            other.id, target.id
        )));
    }
    Ok(())
}

impl Engine {
    /// Validate proposer intent and store it as a `pending` request.
    pub async fn create_change_request(
        &self,
        actor: &Identity,
        new: NewChangeRequest,
    ) -> Result<ChangeRequest, EngineError> {
        let now = self.now();
        if let Some(deadline) = new.deadline
            && deadline <= now
        {
            return Err(EngineError::validation("deadline must be in the future"));
        }
        if let Some(title) = &new.title {
            check_len(title, MAX_NAME_LEN, "title too long")?;
        }

        let (payload, description, default_title) = match new.kind {
            RequestKind::SessionChange => self.build_session_change(actor, &new, now).await?,
            RequestKind::ResourceAllocation => {
                if !matches!(actor.role, Role::Management | Role::Optimizer | Role::System) {
                    return Err(EngineError::Forbidden(format!(
                        "{} may not propose resource allocations",
                        actor.role
                    )));
                }
                if new.allocation.is_empty() {
                    return Err(EngineError::validation("a resource allocation needs at least one change"));
                }
                if new.allocation.len() > MAX_ALLOCATION_CHANGES {
                    return Err(EngineError::LimitExceeded("too many allocation changes"));
                }
                let description = non_blank(new.description.clone());
                if let Some(d) = &description {
                    check_len(d, MAX_TEXT_LEN, "description too long")?;
                }
                let title = format!("resource allocation ({} changes)", new.allocation.len());
                (
                    RequestPayload::ResourceAllocation {
                        changes: new.allocation.clone(),
                    },
                    description,
                    title,
                )
            }
        };

        let request = ChangeRequest {
            id: new.id.unwrap_or_else(Ulid::new),
            proposer: actor.user_id.clone(),
            title: non_blank(new.title).unwrap_or(default_title),
            description,
            priority: new.priority,
            status: RequestStatus::Pending,
            payload,
            reviewer: None,
            review_notes: None,
            approved_location: None,
            clarification_request: None,
            clarification_response: None,
            deadline: new.deadline,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };

        let _gate = self.write_gate().await;
        if self.requests.contains_key(&request.id) {
            return Err(EngineError::validation(format!("change request {} already exists", request.id)));
        }
        self.persist(Event::RequestUpserted { request: request.clone() }).await?;
        self.requests
            .insert(request.id, std::sync::Arc::new(tokio::sync::RwLock::new(request.clone())));
        metrics::counter!(crate::observability::REQUESTS_CREATED_TOTAL, "kind" => request.kind().as_str())
            .increment(1);
        tracing::info!(
            "change request {} created by {} ({})",
            request.id,
            request.proposer,
            request.change_type().unwrap_or(RequestKind::ResourceAllocation.as_str())
        );
        Ok(request)
    }

    async fn build_session_change(
        &self,
        actor: &Identity,
        new: &NewChangeRequest,
        now: Ms,
    ) -> Result<(RequestPayload, Option<String>, String), EngineError> {
        if !matches!(actor.role, Role::Tutor | Role::Management | Role::System) {
            return Err(EngineError::Forbidden(format!("{} may not propose session changes", actor.role)));
        }
        let description = text_min(new.description.as_deref(), "description")?;
        let target_id = new
            .target_id
            .ok_or_else(|| EngineError::validation("a session change needs a target session"))?;
        let change = new
            .change
            .clone()
            .ok_or_else(|| EngineError::validation("a session change needs change data"))?;

        let target = self.get_session(target_id).await?;
        if actor.role == Role::Tutor && actor.user_id != target.tutor_id {
            return Err(EngineError::Forbidden(format!(
                "tutor {} does not own session {target_id}",
                actor.user_id
            )));
        }
        if !target.status.is_active() {
            return Err(EngineError::InvalidState {
                entity: EntityKind::Session,
                id: target_id,
                status: target.status.as_str(),
                action: "propose a change to",
            });
        }

        let mut requires_room = false;
        let change = match change {
            ChangeInput::Duration {
                new_start,
                new_end,
                new_duration_minutes,
            } => {
                let new_span = checked_span(new_start, new_end)?;
                if new_span.start <= now + MIN_RESCHEDULE_LEAD_MS {
                    return Err(EngineError::validation("new start time must be more than a minute from now"));
                }
                if new_duration_minutes <= 0 {
                    return Err(EngineError::validation("newDuration must be a positive number of minutes"));
                }
                if new_duration_minutes.checked_mul(MINUTE_MS) != Some(new_span.duration_ms()) {
                    return Err(EngineError::validation(format!(
                        "newDuration {new_duration_minutes} does not match the new interval ({} ms)",
                        new_span.duration_ms()
                    )));
                }
                requires_room = target.is_offline();
                SessionChange::Duration(DurationChange {
                    new_span,
                    new_duration_minutes,
                })
            }
            ChangeInput::Location {
                online,
                location,
                meeting_link,
            } => {
                let location = non_blank(location);
                let meeting_link = non_blank(meeting_link);
                if online && meeting_link.is_none() {
                    return Err(EngineError::validation("newMeetingLink is required when moving online"));
                }
                if !online && location.is_none() {
                    return Err(EngineError::validation("newLocation is required when moving offline"));
                }
                for v in location.iter().chain(meeting_link.iter()) {
                    check_len(v, MAX_NAME_LEN, "location too long")?;
                }
                SessionChange::Location(LocationChange {
                    online,
                    location,
                    meeting_link,
                })
            }
            ChangeInput::Type {
                new_type,
                merge_session_ids,
                split_into,
            } => match parse_new_type(&new_type) {
                Some(true) => SessionChange::Type(self.build_merge(&target, merge_session_ids).await?),
                Some(false) => {
                    if !target.is_group() {
                        return Err(EngineError::validation("only a group session can be split"));
                    }
                    let into = split_into.ok_or_else(|| EngineError::validation("splitInto is required"))?;
                    if into as usize != target.student_ids.len() {
                        return Err(EngineError::validation(format!(
                            "splitInto {into} must equal the student count {}",
                            target.student_ids.len()
                        )));
                    }
                    SessionChange::Type(TypeChange::Split { into })
                }
                None => return Err(EngineError::validation(format!("unknown newType {new_type:?}"))),
            },
        };

        let title = format!("{} for session {target_id}", change.change_type());
        Ok((
            RequestPayload::SessionChange {
                session_id: target_id,
                change,
                requires_room,
            },
            Some(description),
            title,
        ))
    }

    async fn build_merge(&self, target: &Session, ids: Vec<Ulid>) -> Result<TypeChange, EngineError> {
        let mut seen = HashSet::new();
        let session_ids: Vec<Ulid> = std::iter::once(target.id)
            .chain(ids)
            .filter(|id| seen.insert(*id))
            .collect();
        if session_ids.len() < 2 {
            return Err(EngineError::validation("a merge needs at least two sessions"));
        }
        if session_ids.len() > MAX_MERGE_SESSIONS {
            return Err(EngineError::LimitExceeded("too many sessions in merge"));
        }
        check_mergeable(target, target)?;
        for id in &session_ids[1..] {
            let other = self.get_session(*id).await?;
            check_mergeable(target, &other)?;
        }
        Ok(TypeChange::Merge { session_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duration_payload_accepts_ms_and_rfc3339() {
        let data = json!({
            "newStartTime": "2025-03-12T14:00:00Z",
            "newEndTime": 1741791600000i64,
            "newDuration": 60
        });
        let input = ChangeInput::from_json("change_duration", &data).unwrap();
        assert_eq!(
            input,
            ChangeInput::Duration {
                new_start: 1741788000000,
                new_end: 1741791600000,
                new_duration_minutes: 60,
            }
        );
    }

    #[test]
    fn payload_shape_must_match_change_type() {
        let location = json!({"newIsOnline": true, "newMeetingLink": "https://meet.example/x"});
        assert!(ChangeInput::from_json("change_location", &location).is_ok());
        assert!(matches!(
            ChangeInput::from_json("change_duration", &location),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            ChangeInput::from_json("change_colour", &location),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn merge_ids_must_be_ulids() {
        let data = json!({"newType": "merge", "mergeSessionIds": ["not-an-id"]});
        assert!(matches!(
            ChangeInput::from_json("change_type", &data),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn allocation_changes_bare_or_wrapped() {
        let id = Ulid::new();
        let entry = json!({"resourceId": id.to_string(), "kind": "reassign_tutor", "to": "t2"});
        let bare = allocation_changes_from_json(&json!([entry.clone()])).unwrap();
        let wrapped = allocation_changes_from_json(&json!({"changes": [entry]})).unwrap();
        assert_eq!(bare, wrapped);
        assert_eq!(bare[0].resource_id, id);
        assert!(allocation_changes_from_json(&json!({"items": []})).is_err());
    }

    #[test]
    fn min_text_counts_trimmed_characters() {
        assert!(text_min(Some("  123456789  "), "reason").is_err());
        assert_eq!(text_min(Some("1234567890"), "reason").unwrap(), "1234567890");
        assert!(text_min(None, "reason").is_err());
    }

    #[test]
    fn new_type_aliases() {
        assert_eq!(parse_new_type("Group"), Some(true));
        assert_eq!(parse_new_type("individual"), Some(false));
        assert_eq!(parse_new_type("both"), None);
    }
}
