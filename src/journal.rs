use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability;
use crate::wal::Wal;

/// Durable record of state changes. The engine mutates memory only after
/// `append` returns `Ok`.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Record `event` unless `ticket` was abandoned first. An implementation
    /// must win [`AppendTicket::claim`] before the record can reach storage,
    /// and must answer `Err` without writing when the claim is lost.
    async fn append(&self, event: Event, ticket: Arc<AppendTicket>) -> io::Result<()>;

    /// Replace the whole history with `snapshot`.
    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()>;

    async fn appends_since_compact(&self) -> u64;
}

const QUEUED: u8 = 0;
const CLAIMED: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides one append between the caller and the journal. Whichever side
/// moves it out of the queued state first settles whether the record exists:
/// a caller that gives up before the claim is guaranteed the record is never
/// written, and a claimed record is always answered definitively.
#[derive(Debug, Default)]
pub struct AppendTicket {
    state: AtomicU8,
}

impl AppendTicket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Journal side. `true` means the record may be written.
    pub fn claim(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, CLAIMED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Caller side. `true` means the journal had not started and never will.
    pub fn abandon(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ABANDONED
    }
}

fn abandoned() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "append abandoned before it was written")
}

// ── File journal with group commit ───────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        ticket: Arc<AppendTicket>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, Arc<AppendTicket>, oneshot::Sender<io::Result<()>>);

/// Journal backed by a [`Wal`] file. A single writer task owns the file and
/// batches concurrent appends into one fsync.
pub struct WalJournal {
    tx: mpsc::Sender<WalCommand>,
}

impl WalJournal {
    /// Replay `path`, then start the writer task. Must be called inside a runtime.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (wal, events) = Wal::recover(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx));
        Ok((Self { tx }, events))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> io::Result<oneshot::Receiver<T>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| io::Error::other("journal writer shut down"))?;
        Ok(rx)
    }
}

#[async_trait]
impl Journal for WalJournal {
    async fn append(&self, event: Event, ticket: Arc<AppendTicket>) -> io::Result<()> {
        let rx = self
            .request(|response| WalCommand::Append { event, ticket, response })
            .await?;
        rx.await
            .map_err(|_| io::Error::other("journal writer dropped response"))?
    }

    async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let rx = self
            .request(|response| WalCommand::Compact { events, response })
            .await?;
        rx.await
            .map_err(|_| io::Error::other("journal writer dropped response"))?
    }

    async fn appends_since_compact(&self) -> u64 {
        match self
            .request(|response| WalCommand::AppendsSinceCompact { response })
            .await
        {
            Ok(rx) => rx.await.unwrap_or(0),
            Err(_) => 0,
        }
    }
}

/// 1. Block until the first command arrives.
/// 2. For an Append, drain every Append already queued (the batch window).
/// 3. One `flush_sync` for the whole batch, then answer every sender.
/// 4. A non-Append found while draining runs after the batch is committed.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let first = match cmd {
            WalCommand::Append { event, ticket, response } => (event, ticket, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![first];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, ticket, response }) => batch.push((event, ticket, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("journal writer for {} stopped", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    // Callers that timed out before the claim get no record on disk.
    let (batch, dropped): (Vec<Pending>, Vec<Pending>) =
        batch.into_iter().partition(|(_, ticket, _)| ticket.claim());
    for (_, _, tx) in dropped {
        let _ = tx.send(Err(abandoned()));
    }
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("journal flush of {} records failed: {e}", batch.len());
    }
    for (_, _, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _, _)| wal.append_buffered(event));
    // Flush even after an encode error so half-buffered bytes are not
    // attributed to the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── In-memory journal ────────────────────────────────────────────

/// Keeps records in a `Vec`. Used by tests and benches; `set_failing`
/// simulates an unreachable store.
#[derive(Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<Event>>,
    failing: AtomicBool,
    since_compact: AtomicU64,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Event>> {
        // A poisoned Vec<Event> is still a valid Vec.
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory journal set to fail",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, event: Event, ticket: Arc<AppendTicket>) -> io::Result<()> {
        self.check()?;
        if !ticket.claim() {
            return Err(abandoned());
        }
        self.lock().push(event);
        self.since_compact.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()> {
        self.check()?;
        *self.lock() = snapshot;
        self.since_compact.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        self.since_compact.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use std::path::PathBuf;

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorflow_test_journal");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn availability(i: i64) -> Event {
        Event::AvailabilityAdded {
            tutor_id: format!("t{i}"),
            span: Span::new(i * 1000, i * 1000 + 500),
        }
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_durable() {
        let path = test_path("concurrent.wal");
        let (journal, replayed) = WalJournal::open(&path).unwrap();
        assert!(replayed.is_empty());
        let journal = Arc::new(journal);

        let mut handles = Vec::new();
        for i in 0..50 {
            let j = journal.clone();
            handles.push(tokio::spawn(async move { j.append(availability(i), AppendTicket::new()).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(journal.appends_since_compact().await, 50);

        let events = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 50);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn reopen_returns_history() {
        let path = test_path("reopen.wal");
        {
            let (journal, _) = WalJournal::open(&path).unwrap();
            journal.append(availability(1), AppendTicket::new()).await.unwrap();
            journal.append(availability(2), AppendTicket::new()).await.unwrap();
        }
        let (_journal, replayed) = WalJournal::open(&path).unwrap();
        assert_eq!(replayed, vec![availability(1), availability(2)]);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn compact_through_writer_task() {
        let path = test_path("compact.wal");
        let (journal, _) = WalJournal::open(&path).unwrap();
        for i in 0..10 {
            journal.append(availability(i), AppendTicket::new()).await.unwrap();
        }
        journal.compact(vec![availability(99)]).await.unwrap();
        assert_eq!(journal.appends_since_compact().await, 0);
        journal.append(availability(100), AppendTicket::new()).await.unwrap();

        let events = Wal::replay(&path).unwrap();
        assert_eq!(events, vec![availability(99), availability(100)]);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn memory_journal_failure_switch() {
        let journal = MemoryJournal::new();
        journal.append(availability(1), AppendTicket::new()).await.unwrap();

        journal.set_failing(true);
        assert!(journal.append(availability(2), AppendTicket::new()).await.is_err());
        assert!(journal.compact(Vec::new()).await.is_err());

        journal.set_failing(false);
        journal.append(availability(3), AppendTicket::new()).await.unwrap();
        assert_eq!(journal.events(), vec![availability(1), availability(3)]);
        assert_eq!(journal.appends_since_compact().await, 2);
    }

    #[tokio::test]
    async fn abandoned_ticket_is_never_written() {
        let path = test_path("abandoned.wal");
        let (journal, _) = WalJournal::open(&path).unwrap();
        journal.append(availability(1), AppendTicket::new()).await.unwrap();

        let ticket = AppendTicket::new();
        assert!(ticket.abandon());
        let err = journal.append(availability(2), ticket.clone()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(ticket.is_abandoned());
        journal.append(availability(3), AppendTicket::new()).await.unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![availability(1), availability(3)]);
        assert_eq!(journal.appends_since_compact().await, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn claimed_ticket_cannot_be_abandoned() {
        let journal = MemoryJournal::new();
        let ticket = AppendTicket::new();
        journal.append(availability(1), ticket.clone()).await.unwrap();
        assert!(!ticket.abandon());
        assert!(!ticket.is_abandoned());

        let late = AppendTicket::new();
        assert!(late.abandon());
        assert!(journal.append(availability(2), late).await.is_err());
        assert_eq!(journal.events(), vec![availability(1)]);
    }
}
