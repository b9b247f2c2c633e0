mod applier;
mod availability;
mod builder;
mod conflict;
mod directory;
mod error;
mod optimize;
mod queries;
mod registry;
mod workflow;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use builder::{ChangeInput, NewChangeRequest, allocation_changes_from_json};
pub use conflict::{SESSION_BUFFER_MS, find_conflict};
pub use directory::{NewRoom, RoomFilter};
pub use error::{EngineError, EntityKind, ErrorKind};
pub use queries::{RequestFilter, SessionFilter};
pub use registry::NewSession;
pub use workflow::{Decision, Review};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::journal::{AppendTicket, Journal, WalJournal};
use crate::model::*;

pub type SharedTutorState = Arc<RwLock<TutorState>>;
pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub type SharedRequest = Arc<RwLock<ChangeRequest>>;

/// Source of "now". Injected so tests can pin the time.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

pub const DEFAULT_JOURNAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Clone the values out so no shard lock is held across an await.
pub(super) fn snapshot_arcs<K, V>(map: &DashMap<K, Arc<V>>) -> Vec<Arc<V>>
where
    K: Eq + std::hash::Hash,
{
    map.iter().map(|e| e.value().clone()).collect()
}

fn system_clock() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// In-memory state of one tenant, rebuilt from its journal on open.
pub struct Engine {
    /// Sessions grouped by owning tutor.
    pub(super) tutors: DashMap<String, SharedTutorState>,
    /// Registered rooms keyed by name, with their occupancy index.
    pub(super) rooms: DashMap<String, SharedRoomState>,
    pub(super) requests: DashMap<Ulid, SharedRequest>,
    /// Reverse lookup: session id → tutor id.
    pub(super) session_to_tutor: DashMap<Ulid, String>,
    journal: Arc<dyn Journal>,
    journal_timeout: Duration,
    clock: Clock,
    /// Writers hold it shared for journal + apply; compaction holds it exclusively.
    /// Always taken before any entity lock.
    gate: RwLock<()>,
}

/// Write locks held for one multi-record mutation.
#[derive(Default)]
pub(super) struct Guards {
    pub tutors: BTreeMap<String, OwnedRwLockWriteGuard<TutorState>>,
    pub rooms: BTreeMap<String, OwnedRwLockWriteGuard<RoomState>>,
}

impl Guards {
    pub fn session(&self, id: Ulid) -> Option<&Session> {
        self.tutors.values().find_map(|ts| ts.session(id))
    }
}

impl Engine {
    /// Build an engine over `journal`, replaying `history` first.
    pub fn new(journal: Arc<dyn Journal>, history: Vec<Event>) -> io::Result<Self> {
        let engine = Self {
            tutors: DashMap::new(),
            rooms: DashMap::new(),
            requests: DashMap::new(),
            session_to_tutor: DashMap::new(),
            journal,
            journal_timeout: DEFAULT_JOURNAL_TIMEOUT,
            clock: Arc::new(system_clock),
            gate: RwLock::new(()),
        };
        let count = history.len();
        for event in history {
            engine.replay_event(event)?;
        }
        engine.rebuild_occupancy()?;
        if count > 0 {
            tracing::info!(
                "replayed {count} journal records: {} tutors, {} rooms, {} requests",
                engine.tutors.len(),
                engine.rooms.len(),
                engine.requests.len()
            );
        }
        Ok(engine)
    }

    /// Open (or create) a file-backed engine. Must be called inside a runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (journal, history) = WalJournal::open(path)?;
        Self::new(Arc::new(journal), history)
    }

    pub fn with_clock(mut self, clock: impl Fn() -> Ms + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_journal_timeout(mut self, timeout: Duration) -> Self {
        self.journal_timeout = timeout;
        self
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    // ── Journal ──────────────────────────────────────────────────

    /// Shared half of the compaction gate. Take it before any entity lock and
    /// keep it until the in-memory apply is done.
    pub(super) async fn write_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Durably record `event`. A write that has not started when the timeout
    /// fires is withdrawn and reported `Unavailable`; one already claimed by
    /// the journal is awaited so memory never disagrees with the log.
    pub(super) async fn persist(&self, event: Event) -> Result<(), EngineError> {
        let ticket = AppendTicket::new();
        let append = self.journal.append(event, ticket.clone());
        tokio::pin!(append);
        let result = match tokio::time::timeout(self.journal_timeout, &mut append).await {
            Ok(result) => result,
            Err(_) if ticket.abandon() => {
                tracing::error!("journal append timed out after {:?}", self.journal_timeout);
                return Err(EngineError::Unavailable("journal write timed out".into()));
            }
            Err(_) => {
                tracing::warn!(
                    "journal append exceeded {:?} after it started, waiting for the outcome",
                    self.journal_timeout
                );
                append.await
            }
        };
        result.map_err(|e| {
            tracing::error!("journal append failed: {e}");
            EngineError::Unavailable(e.to_string())
        })
    }

    /// Rewrite the journal as a snapshot of the current state.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;
        let mut events = Vec::new();

        for shared in snapshot_arcs(&self.rooms) {
            let rs = shared.read().await;
            events.push(Event::RoomRegistered { room: rs.room.clone() });
        }
        for shared in snapshot_arcs(&self.tutors) {
            let ts = shared.read().await;
            for span in &ts.availability {
                events.push(Event::AvailabilityAdded {
                    tutor_id: ts.tutor_id.clone(),
                    span: *span,
                });
            }
            for session in &ts.sessions {
                events.push(Event::SessionUpserted { session: session.clone() });
            }
        }
        for shared in snapshot_arcs(&self.requests) {
            let request = shared.read().await;
            events.push(Event::RequestUpserted { request: request.clone() });
        }

        let count = events.len();
        match tokio::time::timeout(self.journal_timeout, self.journal.compact(events)).await {
            Ok(Ok(())) => {
                tracing::info!("compacted journal to {count} records");
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::Unavailable(e.to_string())),
            Err(_) => Err(EngineError::Unavailable("journal compaction timed out".into())),
        }
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }

    // ── Locking ──────────────────────────────────────────────────

    pub(super) fn tutor(&self, tutor_id: &str) -> Option<SharedTutorState> {
        self.tutors.get(tutor_id).map(|e| e.value().clone())
    }

    pub(super) fn tutor_or_create(&self, tutor_id: &str) -> SharedTutorState {
        self.tutors
            .entry(tutor_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(TutorState::new(tutor_id))))
            .value()
            .clone()
    }

    pub(super) fn room(&self, name: &str) -> Option<SharedRoomState> {
        self.rooms.get(name.trim()).map(|e| e.value().clone())
    }

    pub(super) fn request(&self, id: Ulid) -> Result<SharedRequest, EngineError> {
        self.requests
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::ChangeRequest, id))
    }

    pub(super) fn tutor_of(&self, session_id: Ulid) -> Result<String, EngineError> {
        self.session_to_tutor
            .get(&session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::Session, session_id))
    }

    /// Lock the tutors owning `sessions` plus `extra_tutors`, then the rooms those
    /// sessions occupy plus `extra_rooms`. Tutors in id order, then rooms in name
    /// order. Unregistered rooms are skipped; unknown tutors fail `NotFound`.
    pub(super) async fn lock(
        &self,
        sessions: &[Ulid],
        extra_tutors: &[String],
        extra_rooms: &[String],
    ) -> Result<Guards, EngineError> {
        let mut tutor_ids: BTreeSet<String> = extra_tutors.iter().cloned().collect();
        for id in sessions {
            tutor_ids.insert(self.tutor_of(*id)?);
        }

        let mut guards = Guards::default();
        for tutor_id in tutor_ids {
            let shared = self
                .tutor(&tutor_id)
                .ok_or_else(|| EngineError::not_found(EntityKind::Tutor, &tutor_id))?;
            guards.tutors.insert(tutor_id, shared.write_owned().await);
        }

        // A session may have been reassigned while we waited.
        let mut room_names: BTreeSet<String> =
            extra_rooms.iter().map(|r| r.trim().to_string()).collect();
        for id in sessions {
            let session = guards
                .session(*id)
                .ok_or(EngineError::ConcurrentModification(*id))?;
            if let Some(room) = session.occupied_room() {
                room_names.insert(room.to_string());
            }
        }

        for name in room_names {
            if let Some(shared) = self.room(&name) {
                guards.rooms.insert(name, shared.write_owned().await);
            }
        }
        Ok(guards)
    }

    /// Every tutor and registered room `sessions` would touch must be locked.
    pub(super) fn check_covered(&self, guards: &Guards, sessions: &[Session]) -> Result<(), EngineError> {
        for session in sessions {
            let previous = guards.session(session.id);
            let tutors_ok = guards.tutors.contains_key(&session.tutor_id)
                && match self.session_to_tutor.get(&session.id) {
                    Some(t) => guards.tutors.contains_key(t.value()),
                    None => true,
                };
            let rooms_ok = [previous.and_then(Session::occupied_room), session.occupied_room()]
                .into_iter()
                .flatten()
                .all(|room| guards.rooms.contains_key(room) || !self.rooms.contains_key(room));
            if !tutors_ok || !rooms_ok {
                return Err(EngineError::ConcurrentModification(session.id));
            }
        }
        Ok(())
    }

    /// Replace (or insert) a session under held locks, keeping the tutor index,
    /// the reverse map and room occupancy in step.
    pub(super) fn apply_session(&self, guards: &mut Guards, session: Session) {
        let previous_tutor = self.session_to_tutor.get(&session.id).map(|e| e.value().clone());
        if let Some(prev) = previous_tutor
            && let Some(ts) = guards.tutors.get_mut(&prev)
            && let Some(old) = ts.remove_session(session.id)
            && let Some(room) = old.occupied_room()
            && let Some(rs) = guards.rooms.get_mut(room)
        {
            rs.remove_occupancy(old.id);
        }

        if let Some(room) = session.occupied_room()
            && let Some(rs) = guards.rooms.get_mut(room)
        {
            rs.insert_occupancy(Occupancy {
                session_id: session.id,
                span: session.span,
            });
        }
        self.session_to_tutor.insert(session.id, session.tutor_id.clone());
        if let Some(ts) = guards.tutors.get_mut(&session.tutor_id) {
            ts.insert_session(session);
        }
    }

    // ── Replay ───────────────────────────────────────────────────

    fn replay_event(&self, event: Event) -> io::Result<()> {
        match event {
            Event::RoomRegistered { room } => {
                self.rooms
                    .insert(room.name.clone(), Arc::new(RwLock::new(RoomState::new(room))));
            }
            Event::AvailabilityAdded { tutor_id, span } => {
                let shared = self.tutor_or_create(&tutor_id);
                let mut ts = shared
                    .try_write()
                    .map_err(|_| io::Error::other("replay: tutor lock contended"))?;
                ts.add_availability(span);
            }
            Event::SessionUpserted { session } => self.replay_session(session)?,
            Event::RequestUpserted { request } => self.replay_request(request),
            Event::ChangeApplied { request, sessions } => {
                for session in sessions {
                    self.replay_session(session)?;
                }
                self.replay_request(request);
            }
        }
        Ok(())
    }

    /// We are the sole owner of every Arc during replay, so `try_write_owned`
    /// always succeeds. Room occupancy is rebuilt once at the end.
    fn replay_session(&self, session: Session) -> io::Result<()> {
        let mut guards = Guards::default();
        let mut tutor_ids = vec![session.tutor_id.clone()];
        if let Some(prev) = self.session_to_tutor.get(&session.id) {
            tutor_ids.push(prev.value().clone());
        }
        for tutor_id in tutor_ids {
            if guards.tutors.contains_key(&tutor_id) {
                continue;
            }
            let guard = self
                .tutor_or_create(&tutor_id)
                .try_write_owned()
                .map_err(|_| io::Error::other("replay: tutor lock contended"))?;
            guards.tutors.insert(tutor_id, guard);
        }
        self.apply_session(&mut guards, session);
        Ok(())
    }

    fn replay_request(&self, request: ChangeRequest) {
        self.requests.insert(request.id, Arc::new(RwLock::new(request)));
    }

    fn rebuild_occupancy(&self) -> io::Result<()> {
        for entry in self.tutors.iter() {
            let ts = entry
                .value()
                .try_read()
                .map_err(|_| io::Error::other("replay: tutor lock contended"))?;
            for session in &ts.sessions {
                let Some(room) = session.occupied_room() else { continue };
                let Some(shared) = self.room(room) else { continue };
                let mut rs = shared
                    .try_write()
                    .map_err(|_| io::Error::other("replay: room lock contended"))?;
                rs.insert_occupancy(Occupancy {
                    session_id: session.id,
                    span: session.span,
                });
            }
        }
        Ok(())
    }
}
