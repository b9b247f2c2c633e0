use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, snapshot_arcs};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub id: Option<Ulid>,
    pub tutor_id: Option<String>,
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub id: Option<Ulid>,
    pub kind: Option<RequestKind>,
    pub status: Option<RequestStatus>,
}

impl SessionFilter {
    fn matches(&self, session: &Session) -> bool {
        self.id.is_none_or(|id| session.id == id)
            && self.tutor_id.as_deref().is_none_or(|t| session.tutor_id == t.trim())
            && self.status.is_none_or(|s| session.status == s)
    }
}

impl RequestFilter {
    fn matches(&self, request: &ChangeRequest) -> bool {
        self.id.is_none_or(|id| request.id == id)
            && self.kind.is_none_or(|k| request.kind() == k)
            && self.status.is_none_or(|s| request.status == s)
    }
}

impl Engine {
    pub async fn get_session(&self, id: Ulid) -> Result<Session, EngineError> {
        // Retry once: the session may move to another tutor between lookup and read.
        for _ in 0..2 {
            let tutor_id = self.tutor_of(id)?;
            if let Some(shared) = self.tutor(&tutor_id) {
                let ts = shared.read().await;
                if let Some(session) = ts.session(id) {
                    return Ok(session.clone());
                }
            }
        }
        Err(EngineError::ConcurrentModification(id))
    }

    /// Sessions ordered by start, then id.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Vec<Session> {
        if let Some(id) = filter.id {
            return match self.get_session(id).await {
                Ok(s) if filter.matches(&s) => vec![s],
                _ => Vec::new(),
            };
        }
        let tutors = match &filter.tutor_id {
            Some(t) => self.tutor(t.trim()).into_iter().collect(),
            None => snapshot_arcs(&self.tutors),
        };
        let mut out = Vec::new();
        for shared in tutors {
            let ts = shared.read().await;
            out.extend(ts.sessions.iter().filter(|s| filter.matches(s)).cloned());
        }
        out.sort_by_key(|s| (s.span.start, s.id));
        out
    }

    pub async fn get_change_request(&self, id: Ulid) -> Result<ChangeRequest, EngineError> {
        let shared = self.request(id)?;
        let request = shared.read().await;
        Ok(request.clone())
    }

    /// Requests ordered by creation (ULIDs sort by time).
    pub async fn list_change_requests(&self, filter: &RequestFilter) -> Vec<ChangeRequest> {
        if let Some(id) = filter.id {
            return match self.get_change_request(id).await {
                Ok(r) if filter.matches(&r) => vec![r],
                _ => Vec::new(),
            };
        }
        let mut out = Vec::new();
        for shared in snapshot_arcs(&self.requests) {
            let request = shared.read().await;
            if filter.matches(&request) {
                out.push(request.clone());
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// Open requests whose deadline is at or before `now`.
    pub(crate) async fn overdue_requests(&self, now: Ms) -> Vec<Ulid> {
        let mut out = Vec::new();
        for shared in snapshot_arcs(&self.requests) {
            let request = shared.read().await;
            if request.status.is_open() && request.deadline.is_some_and(|d| d <= now) {
                out.push(request.id);
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::session;

    #[test]
    fn session_filter_fields_combine() {
        let s = session("t1", &["s1"], 0, 1);
        assert!(SessionFilter::default().matches(&s));
        assert!(
            SessionFilter {
                tutor_id: Some(" t1 ".into()),
                status: Some(SessionStatus::Confirmed),
                ..Default::default()
            }
            .matches(&s)
        );
        assert!(
            !SessionFilter {
                status: Some(SessionStatus::Pending),
                ..Default::default()
            }
            .matches(&s)
        );
        assert!(
            !SessionFilter {
                id: Some(Ulid::new()),
                ..Default::default()
            }
            .matches(&s)
        );
    }
}
