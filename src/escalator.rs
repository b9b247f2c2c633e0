use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that escalates change requests whose deadline has passed.
pub async fn run_escalator(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let escalated = engine.escalate_overdue().await;
        if escalated > 0 {
            info!("escalated {escalated} overdue change requests");
        }
    }
}

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.journal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.compact().await {
            tracing::warn!("journal compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChangeInput, NewChangeRequest, NewSession};
    use crate::journal::MemoryJournal;
    use crate::model::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicI64, Ordering};

    const NOW: Ms = 1_740_787_200_000;
    const H: Ms = 3_600_000;

    #[tokio::test(start_paused = true)]
    async fn escalator_sweeps_overdue_requests() {
        let clock = Arc::new(AtomicI64::new(NOW));
        let c = clock.clone();
        let engine = Arc::new(
            Engine::new(Arc::new(MemoryJournal::new()), Vec::new())
                .unwrap()
                .with_clock(move || c.load(Ordering::SeqCst)),
        );
        let tutor = Identity::new("t1", Role::Tutor);
        let session = engine
            .create_session(
                &tutor,
                NewSession {
                    id: None,
                    tutor_id: "t1".into(),
                    student_ids: vec!["s1".into()],
                    subject: "Chemistry".into(),
                    start: NOW + 24 * H,
                    end: NOW + 25 * H,
                    mode: Mode::Online,
                    location: None,
                    meeting_link: Some("https://meet.example/c".into()),
                    equipment: BTreeSet::new(),
                    class_id: None,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let mut new = NewChangeRequest::session_change(
            session.id,
            ChangeInput::Duration {
                new_start: NOW + 48 * H,
                new_end: NOW + 49 * H,
                new_duration_minutes: 60,
            },
            "Lab is closed on that day.",
        );
        new.deadline = Some(NOW + H);
        let request = engine.create_change_request(&tutor, new).await.unwrap();

        tokio::spawn(run_escalator(engine.clone(), Duration::from_secs(30)));
        clock.store(NOW + 2 * H, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(31)).await;

        let request = engine.get_change_request(request.id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Escalated);
    }
}
