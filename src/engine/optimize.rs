use std::collections::{BTreeMap, BTreeSet};

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{SESSION_BUFFER_MS, find_conflict};
use super::{Engine, EngineError, snapshot_arcs};

/// Read-only copy of the tenant taken under read locks. Proposals are
/// simulated against it so later proposals account for earlier ones.
struct Snapshot {
    tutors: BTreeMap<String, TutorState>,
    rooms: BTreeMap<String, RoomState>,
}

impl Snapshot {
    /// Active sessions inside the window, ordered by start.
    fn in_window(&self, tutor_id: &str, window: &Span) -> Vec<Session> {
        self.tutors
            .get(tutor_id)
            .map(|ts| {
                ts.overlapping(window)
                    .filter(|s| s.status.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn load(&self, tutor_id: &str, window: &Span) -> usize {
        self.in_window(tutor_id, window).len()
    }

    fn replace(&mut self, session: Session, previous_tutor: &str) {
        if let Some(ts) = self.tutors.get_mut(previous_tutor) {
            ts.remove_session(session.id);
        }
        if let Some(ts) = self.tutors.get_mut(&session.tutor_id) {
            ts.insert_session(session);
        }
    }
}

#[derive(Default)]
struct Planner {
    changes: Vec<AllocationChange>,
    impact: ImpactSummary,
    tutors: BTreeSet<String>,
}

impl Planner {
    fn propose(&mut self, session: &Session, kind: AllocationKind, from: String, to: String, rationale: String) {
        match kind {
            AllocationKind::ReallocateRoom => self.impact.room_reallocations += 1,
            AllocationKind::ReassignTutor => {
                self.impact.tutor_reassignments += 1;
                self.tutors.insert(to.clone());
            }
            AllocationKind::AdjustGroupSize => self.impact.group_adjustments += 1,
            AllocationKind::AdjustSchedule => self.impact.schedule_adjustments += 1,
        }
        self.tutors.insert(session.tutor_id.clone());
        self.changes.push(AllocationChange {
            resource_id: session.id,
            kind,
            from,
            to,
            rationale,
        });
    }

    fn finish(mut self, window: Span, now: Ms) -> OptimizationPlan {
        self.impact.tutors_affected = self.tutors.len();
        OptimizationPlan {
            id: Ulid::new(),
            generated_at: now,
            window,
            changes: self.changes,
            impact: self.impact,
        }
    }
}

/// Explicit cap, or half again the mean load (at least one above it).
fn workload_threshold(loads: &BTreeMap<String, usize>, explicit: Option<u32>) -> usize {
    if let Some(max) = explicit {
        return max as usize;
    }
    if loads.is_empty() {
        return usize::MAX;
    }
    let total: usize = loads.values().sum();
    let mean = total.div_ceil(loads.len());
    (mean + mean / 2).max(mean + 1)
}

fn plan_workload(snap: &mut Snapshot, window: &Span, explicit: Option<u32>, planner: &mut Planner) {
    let mut loads: BTreeMap<String, usize> = snap
        .tutors
        .keys()
        .map(|id| (id.clone(), snap.load(id, window)))
        .collect();
    let threshold = workload_threshold(&loads, explicit);

    let mut overloaded: Vec<(String, usize)> = loads
        .iter()
        .filter(|(_, load)| **load > threshold)
        .map(|(id, load)| (id.clone(), *load))
        .collect();
    overloaded.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    for (tutor_id, _) in overloaded {
        // latest sessions move first; class-linked ones are pinned
        let mut movable: Vec<Session> = snap
            .in_window(&tutor_id, window)
            .into_iter()
            .filter(|s| s.class_id.is_none())
            .collect();
        movable.reverse();

        for session in movable {
            if loads[&tutor_id] <= threshold {
                break;
            }
            let mut candidates: Vec<(&String, &usize)> = loads
                .iter()
                .filter(|(id, load)| **id != tutor_id && **load < threshold)
                .collect();
            candidates.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
            let Some(target) = candidates
                .into_iter()
                .map(|(id, _)| id.clone())
                .find(|id| {
                    snap.tutors
                        .get(id)
                        .is_some_and(|ts| find_conflict(ts, &session.span, &[], SESSION_BUFFER_MS).is_none())
                })
            else {
                continue;
            };

            let rationale = format!(
                "{tutor_id} has {} sessions in the window (threshold {threshold}); {target} has {}",
                loads[&tutor_id], loads[&target]
            );
            planner.propose(&session, AllocationKind::ReassignTutor, tutor_id.clone(), target.clone(), rationale);
            if let Some(l) = loads.get_mut(&tutor_id) {
                *l -= 1;
            }
            if let Some(l) = loads.get_mut(&target) {
                *l += 1;
            }
            let mut moved = session.clone();
            moved.tutor_id = target;
            snap.replace(moved, &tutor_id);
        }
    }
}

fn utilization_pct(students: usize, capacity: u32) -> u32 {
    ((students * 100) / (capacity.max(1) as usize)) as u32
}

fn plan_rooms(snap: &mut Snapshot, window: &Span, min_pct: u32, planner: &mut Planner) {
    let sessions: Vec<Session> = snap
        .tutors
        .keys()
        .flat_map(|t| snap.in_window(t, window))
        .filter(|s| s.occupied_room().is_some_and(|r| snap.rooms.contains_key(r)))
        .collect();

    for session in sessions {
        let Some(current_name) = session.occupied_room().map(str::to_string) else {
            continue;
        };
        let Some(current) = snap.rooms.get(&current_name).map(|rs| rs.room.clone()) else {
            continue;
        };
        let students = session.student_ids.len();
        let missing = current.missing_equipment(&session.equipment);
        let too_small = students > current.capacity as usize;
        let underused = utilization_pct(students, current.capacity) < min_pct;
        if missing.is_empty() && !too_small && !underused {
            continue;
        }

        let mut options: Vec<&RoomState> = snap
            .rooms
            .values()
            .filter(|rs| {
                rs.room.name != current_name
                    && rs.room.capacity as usize >= students
                    && rs.room.supports(&session.equipment)
                    && rs.overlapping(&session.span).next().is_none()
            })
            .collect();
        options.sort_by(|a, b| a.room.capacity.cmp(&b.room.capacity).then_with(|| a.room.name.cmp(&b.room.name)));
        // an underused room is only worth leaving for a smaller one
        let Some(best) = options
            .into_iter()
            .find(|rs| !missing.is_empty() || too_small || rs.room.capacity < current.capacity)
        else {
            continue;
        };

        let best_name = best.room.name.clone();
        let rationale = if !missing.is_empty() {
            let missing: Vec<_> = missing.iter().map(Equipment::as_str).collect();
            format!("{current_name} lacks {}", missing.join(", "))
        } else if too_small {
            format!("{current_name} seats {} for {students} students", current.capacity)
        } else {
            format!(
                "{current_name} is {}% used; {best_name} would be {}%",
                utilization_pct(students, current.capacity),
                utilization_pct(students, best.room.capacity)
            )
        };
        planner.propose(&session, AllocationKind::ReallocateRoom, current_name.clone(), best_name.clone(), rationale);

        let occupancy = Occupancy {
            session_id: session.id,
            span: session.span,
        };
        if let Some(rs) = snap.rooms.get_mut(&current_name) {
            rs.remove_occupancy(session.id);
        }
        if let Some(rs) = snap.rooms.get_mut(&best_name) {
            rs.insert_occupancy(occupancy);
        }
    }
}

fn plan_group_sizes(snap: &Snapshot, window: &Span, max: u32, planner: &mut Planner) {
    for tutor_id in snap.tutors.keys() {
        for session in snap.in_window(tutor_id, window) {
            let students = session.student_ids.len() as u32;
            let limit = session.group_limit.unwrap_or(students);
            if !session.is_group() || limit <= max {
                continue;
            }
            // never below the current enrolment
            let to = max.max(students);
            if session.group_limit == Some(to) {
                continue;
            }
            let rationale = if students > max {
                format!("{students} students exceed the maximum group size {max}; freeze enrolment")
            } else {
                format!("group limit {limit} exceeds the maximum {max}")
            };
            planner.propose(
                &session,
                AllocationKind::AdjustGroupSize,
                session.group_limit.map(|l| l.to_string()).unwrap_or_default(),
                to.to_string(),
                rationale,
            );
        }
    }
}

/// First start at or after `from` where `session` fits the tutor's calendar.
fn next_free_start(ts: &TutorState, session: &Session, from: Ms) -> Option<Ms> {
    let duration = session.span.duration_ms();
    let mut start = from;
    for _ in 0..=ts.sessions.len() {
        let candidate = Span::new(start, start + duration);
        match find_conflict(ts, &candidate, &[session.id], SESSION_BUFFER_MS) {
            None => return Some(start),
            Some(hit) => start = hit.span.end + SESSION_BUFFER_MS,
        }
    }
    None
}

fn plan_schedule(snap: &mut Snapshot, window: &Span, now: Ms, planner: &mut Planner) {
    let tutor_ids: Vec<String> = snap.tutors.keys().cloned().collect();
    for tutor_id in tutor_ids {
        let sessions: Vec<Session> = snap
            .in_window(&tutor_id, window)
            .into_iter()
            .filter(Session::blocks_tutor)
            .collect();
        let mut previous: Option<Session> = None;
        for session in sessions {
            let Some(prev) = previous.take() else {
                previous = Some(session);
                continue;
            };
            if prev.span.end + SESSION_BUFFER_MS <= session.span.start {
                previous = Some(session);
                continue;
            }
            let earliest = (prev.span.end + SESSION_BUFFER_MS).max(now + MIN_RESCHEDULE_LEAD_MS + 1);
            let Some(start) = snap
                .tutors
                .get(&tutor_id)
                .and_then(|ts| next_free_start(ts, &session, earliest))
            else {
                previous = Some(prev);
                continue;
            };
            if start + session.span.duration_ms() > MAX_VALID_TIMESTAMP_MS {
                previous = Some(prev);
                continue;
            }

            planner.impact.minutes_moved += (start - session.span.start) / MINUTE_MS;
            let rationale = format!(
                "starts {} min after {} ends; needs {} min",
                (session.span.start - prev.span.end) / MINUTE_MS,
                prev.id,
                SESSION_BUFFER_MS / MINUTE_MS
            );
            planner.propose(
                &session,
                AllocationKind::AdjustSchedule,
                session.span.start.to_string(),
                start.to_string(),
                rationale,
            );
            let mut moved = session.clone();
            moved.span = session.span.shifted_to(start);
            snap.replace(moved, &tutor_id);
            previous = Some(prev);
        }
    }
}

impl Engine {
    /// Suggest allocation changes for `window`. Nothing is written.
    pub async fn generate_optimization_plan(
        &self,
        actor: &Identity,
        focus: &BTreeSet<FocusArea>,
        constraints: PlanConstraints,
    ) -> Result<OptimizationPlan, EngineError> {
        if !matches!(actor.role, Role::Management | Role::Optimizer | Role::System) {
            return Err(EngineError::Forbidden(format!(
                "{} may not generate optimisation plans",
                actor.role
            )));
        }
        let window = constraints.window;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("plan window too wide"));
        }
        if constraints.min_room_utilization_pct > 100 {
            return Err(EngineError::validation("min_room_utilization must be a percentage"));
        }
        if constraints.max_group_size == Some(0) || constraints.max_sessions_per_tutor == Some(0) {
            return Err(EngineError::validation("plan limits must be positive"));
        }

        let mut snap = Snapshot {
            tutors: BTreeMap::new(),
            rooms: BTreeMap::new(),
        };
        for shared in snapshot_arcs(&self.tutors) {
            let ts = shared.read().await;
            snap.tutors.insert(ts.tutor_id.clone(), ts.clone());
        }
        for shared in snapshot_arcs(&self.rooms) {
            let rs = shared.read().await;
            snap.rooms.insert(rs.room.name.clone(), rs.clone());
        }

        let all = [FocusArea::Workload, FocusArea::Rooms, FocusArea::GroupSize, FocusArea::Schedule];
        let areas: BTreeSet<FocusArea> = if focus.is_empty() {
            all.into_iter().collect()
        } else {
            focus.clone()
        };

        let now = self.now();
        let mut planner = Planner::default();
        for area in areas {
            match area {
                FocusArea::Workload => plan_workload(&mut snap, &window, constraints.max_sessions_per_tutor, &mut planner),
                FocusArea::Rooms => plan_rooms(&mut snap, &window, constraints.min_room_utilization_pct, &mut planner),
                FocusArea::GroupSize => {
                    if let Some(max) = constraints.max_group_size {
                        plan_group_sizes(&snap, &window, max, &mut planner);
                    }
                }
                FocusArea::Schedule => plan_schedule(&mut snap, &window, now, &mut planner),
            }
            if planner.changes.len() >= MAX_ALLOCATION_CHANGES {
                planner.changes.truncate(MAX_ALLOCATION_CHANGES);
                break;
            }
        }

        let plan = planner.finish(window, now);
        tracing::info!(
            "optimisation plan {}: {} changes for {} tutors",
            plan.id,
            plan.changes.len(),
            plan.impact.tutors_affected
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{room, session};

    const H: Ms = 3_600_000;
    const BASE: Ms = 1_741_597_200_000; // 2025-03-10T09:00Z

    fn snapshot(sessions: Vec<Session>, rooms: Vec<Room>, tutors: &[&str]) -> Snapshot {
        let mut snap = Snapshot {
            tutors: tutors.iter().map(|t| (t.to_string(), TutorState::new(t))).collect(),
            rooms: BTreeMap::new(),
        };
        for r in rooms {
            snap.rooms.insert(r.name.clone(), RoomState::new(r));
        }
        for s in sessions {
            if let Some(room) = s.occupied_room()
                && let Some(rs) = snap.rooms.get_mut(room)
            {
                rs.insert_occupancy(Occupancy { session_id: s.id, span: s.span });
            }
            snap.tutors
                .entry(s.tutor_id.clone())
                .or_insert_with(|| TutorState::new(&s.tutor_id))
                .insert_session(s);
        }
        snap
    }

    fn window() -> Span {
        Span::new(BASE - DAY_MS, BASE + 7 * DAY_MS)
    }

    #[test]
    fn threshold_defaults_above_the_mean() {
        let loads: BTreeMap<String, usize> = [("a".to_string(), 6), ("b".to_string(), 0)].into_iter().collect();
        assert_eq!(workload_threshold(&loads, None), 4);
        assert_eq!(workload_threshold(&loads, Some(2)), 2);
        let one: BTreeMap<String, usize> = [("a".to_string(), 1)].into_iter().collect();
        assert_eq!(workload_threshold(&one, None), 2);
    }

    #[test]
    fn overloaded_tutor_sheds_to_least_loaded() {
        let sessions: Vec<Session> = (0..4)
            .map(|i| session("busy", &["s1"], BASE + i * 3 * H, BASE + i * 3 * H + H))
            .collect();
        let mut snap = snapshot(sessions, vec![], &["busy", "idle"]);
        let mut planner = Planner::default();
        plan_workload(&mut snap, &window(), Some(2), &mut planner);
        assert_eq!(planner.changes.len(), 2);
        assert!(planner.changes.iter().all(|c| c.kind == AllocationKind::ReassignTutor && c.to == "idle"));
        assert_eq!(snap.load("busy", &window()), 2);
        assert_eq!(snap.load("idle", &window()), 2);
    }

    #[test]
    fn reassignment_skips_tutors_with_a_clash() {
        let early = session("busy", &["s1"], BASE, BASE + H);
        let middle = session("busy", &["s2"], BASE + 5 * H, BASE + 6 * H);
        let late = session("busy", &["s3"], BASE + 10 * H, BASE + 11 * H);
        let theirs = session("other", &["s4"], BASE + 11 * H, BASE + 12 * H);
        let (middle_id, late_id) = (middle.id, late.id);
        let mut snap = snapshot(vec![early, middle, late, theirs], vec![], &[]);
        let mut planner = Planner::default();
        plan_workload(&mut snap, &window(), Some(2), &mut planner);
        // the latest session would clash with "other", so the next one moves
        assert_eq!(planner.changes.len(), 1);
        assert_eq!(planner.changes[0].resource_id, middle_id);
        assert_ne!(planner.changes[0].resource_id, late_id);
    }

    #[test]
    fn underused_room_moves_to_smallest_fit() {
        let mut s = session("t1", &["s1", "s2"], BASE, BASE + H);
        s.mode = Mode::Offline;
        s.location = Some("HALL".into());
        let mut snap = snapshot(
            vec![s],
            vec![room("HALL", 200, &[]), room("A1", 4, &[]), room("A2", 2, &[]), room("A3", 1, &[])],
            &[],
        );
        let mut planner = Planner::default();
        plan_rooms(&mut snap, &window(), 25, &mut planner);
        assert_eq!(planner.changes.len(), 1);
        assert_eq!(planner.changes[0].from, "HALL");
        assert_eq!(planner.changes[0].to, "A2");
        assert_eq!(planner.impact.room_reallocations, 1);
    }

    #[test]
    fn buffer_violations_get_pushed_back() {
        let a = session("t1", &["s1"], BASE, BASE + H);
        let b = session("t1", &["s2"], BASE + H + 10 * MINUTE_MS, BASE + 2 * H + 10 * MINUTE_MS);
        let b_id = b.id;
        let mut snap = snapshot(vec![a, b], vec![], &[]);
        let mut planner = Planner::default();
        plan_schedule(&mut snap, &window(), BASE - DAY_MS, &mut planner);
        assert_eq!(planner.changes.len(), 1);
        assert_eq!(planner.changes[0].resource_id, b_id);
        assert_eq!(planner.changes[0].to, (BASE + H + 30 * MINUTE_MS).to_string());
        assert_eq!(planner.impact.minutes_moved, 20);
    }

    #[test]
    fn group_limits_never_drop_below_enrolment() {
        let big = session("t1", &["a", "b", "c", "d"], BASE, BASE + H);
        let mut loose = session("t1", &["a", "b"], BASE + 3 * H, BASE + 4 * H);
        loose.group_limit = Some(30);
        let snap = snapshot(vec![big, loose], vec![], &[]);
        let mut planner = Planner::default();
        plan_group_sizes(&snap, &window(), 3, &mut planner);
        let targets: Vec<&str> = planner.changes.iter().map(|c| c.to.as_str()).collect();
        assert_eq!(targets, vec!["4", "3"]);
    }
}
