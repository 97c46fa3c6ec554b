// Mission progress state machine
// Idle -> Active -> {Completed, Failed, Abandoned} -> Idle
//
// Every function here is pure: snapshot in, next snapshot out. Callers run them inside
// CompletionResolver::apply so each transition commits against the version it was checked on.

use spacetimedb::{SpacetimeType, Timestamp};

use crate::catalog::{MissionCatalog, MissionPlan};
use crate::error::{MissionError, RecordKind};
use crate::resolver::{Applied, CompletionResolver, Transition};
use crate::store::TeamStore;
use crate::unlock::verify_code;
use crate::Team;

// ==================== TYPES ====================

/// A password digit collected at a checkpoint
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct CollectedDigit {
    pub checkpoint_id: String,
    /// Declared position in the unlock code
    pub position: i32,
    pub value: String,
}

/// Execution state of a team's active mission
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct MissionProgress {
    /// First resolved-order checkpoint not yet completed; None once all are done
    pub current_checkpoint_id: Option<String>,

    /// In completion order, no duplicates
    pub completed_checkpoint_ids: Vec<String>,

    /// Kept sorted by position; read through digits() regardless
    pub collected_digits: Vec<CollectedDigit>,

    pub started_at: Timestamp,

    /// Last 15-minute reminder boundary announced to the team
    pub last_reminder_minutes: Option<u32>,
}

impl MissionProgress {
    pub fn new(head: &str, started_at: Timestamp) -> Self {
        Self {
            current_checkpoint_id: Some(head.to_string()),
            completed_checkpoint_ids: Vec::new(),
            collected_digits: Vec::new(),
            started_at,
            last_reminder_minutes: None,
        }
    }

    pub fn is_completed(&self, checkpoint_id: &str) -> bool {
        self.completed_checkpoint_ids.iter().any(|id| id == checkpoint_id)
    }

    /// Collected digits sorted by position, whatever order completions arrived in
    pub fn digits(&self) -> Vec<&CollectedDigit> {
        let mut digits: Vec<&CollectedDigit> = self.collected_digits.iter().collect();
        digits.sort_by_key(|d| d.position);
        digits
    }

    /// Digit values in position order
    pub fn digit_values(&self) -> Vec<&str> {
        self.digits().into_iter().map(|d| d.value.as_str()).collect()
    }

    /// Unlock code assembled from collected digits
    pub fn assembled_code(&self) -> String {
        self.digit_values().concat()
    }
}

/// Archived record of a completed mission
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct CompletedMission {
    pub mission_id: String,
    pub completed_at: Timestamp,
    pub collected_digits: Vec<CollectedDigit>,
    pub completed_checkpoint_ids: Vec<String>,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    DeadlineExceeded, // Monitor saw remaining <= 0
    Aborted,          // Game master ended the mission
}

/// Archived record of a failed mission
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct FailedMission {
    pub mission_id: String,
    pub failed_at: Timestamp,
    pub reason: FailReason,
    pub mission_progress: MissionProgress,
}

// ==================== TRANSITIONS ====================

fn active_parts<'t>(team: &'t Team) -> Result<(&'t str, &'t MissionProgress), MissionError> {
    match (team.active_mission_id.as_deref(), team.mission_progress.as_ref()) {
        (Some(mission_id), Some(progress)) => Ok((mission_id, progress)),
        _ => Err(MissionError::NoActiveMission(team.id.clone())),
    }
}

fn ensure_idle(team: &Team) -> Result<(), MissionError> {
    match &team.active_mission_id {
        Some(active) => Err(MissionError::AlreadyActive {
            team_id: team.id.clone(),
            mission_id: active.clone(),
        }),
        None => Ok(()),
    }
}

/// Idle -> Active
pub fn start(team: &Team, plan: &MissionPlan, now: Timestamp) -> Result<Team, MissionError> {
    ensure_idle(team)?;
    if !plan.mission.active {
        return Err(MissionError::MissionInactive(plan.mission.id.clone()));
    }
    let head = plan
        .order()
        .head()
        .ok_or_else(|| MissionError::EmptyMission(plan.mission.id.clone()))?;

    let mut next = team.clone();
    next.active_mission_id = Some(plan.mission.id.clone());
    next.mission_progress = Some(MissionProgress::new(head, now));
    Ok(next)
}

/// Record a verified checkpoint completion.
///
/// Re-sending an already completed checkpoint is a no-op. Any other checkpoint that is not
/// the current one is rejected without touching state.
pub fn advance(
    team: &Team,
    plan: &MissionPlan,
    checkpoint_id: &str,
    digit: Option<&str>,
) -> Result<Transition, MissionError> {
    let (mission_id, progress) = active_parts(team)?;
    if mission_id != plan.mission.id || !plan.order().contains(checkpoint_id) {
        return Err(MissionError::not_found(RecordKind::Checkpoint, checkpoint_id));
    }

    if progress.is_completed(checkpoint_id) {
        return Ok(Transition::Unchanged);
    }

    if progress.current_checkpoint_id.as_deref() != Some(checkpoint_id) {
        return Err(MissionError::OutOfOrder {
            requested: checkpoint_id.to_string(),
            current: progress.current_checkpoint_id.clone(),
        });
    }

    let mut progress = progress.clone();
    progress.completed_checkpoint_ids.push(checkpoint_id.to_string());

    if let Some(value) = digit.or_else(|| plan.declared_digit(checkpoint_id)) {
        let position = plan.digit_position(checkpoint_id);
        // Insert after equal positions so ties keep arrival order
        let at = progress
            .collected_digits
            .partition_point(|d| d.position <= position);
        progress.collected_digits.insert(
            at,
            CollectedDigit {
                checkpoint_id: checkpoint_id.to_string(),
                position,
                value: value.to_string(),
            },
        );
    }

    progress.current_checkpoint_id = plan
        .order()
        .first_pending(&progress.completed_checkpoint_ids)
        .map(str::to_string);

    let mut next = team.clone();
    next.mission_progress = Some(progress);
    Ok(Transition::Updated(next))
}

/// Active -> Completed -> Idle. Requires every checkpoint done and the exact unlock code.
pub fn complete(
    team: &Team,
    plan: &MissionPlan,
    attempt: &str,
    now: Timestamp,
) -> Result<Team, MissionError> {
    let (mission_id, progress) = active_parts(team)?;
    if mission_id != plan.mission.id {
        return Err(MissionError::not_found(RecordKind::Mission, mission_id));
    }

    let remaining = plan.order().pending_count(&progress.completed_checkpoint_ids);
    if remaining > 0 {
        return Err(MissionError::CheckpointsRemaining { remaining });
    }
    verify_code(&plan.mission.password, attempt)?;

    let record = CompletedMission {
        mission_id: mission_id.to_string(),
        completed_at: now,
        collected_digits: progress.digits().into_iter().cloned().collect(),
        completed_checkpoint_ids: progress.completed_checkpoint_ids.clone(),
    };

    let mut next = team.clone();
    next.completed_missions.push(record.mission_id.clone());
    next.completed_mission_progress.push(record);
    next.active_mission_id = None;
    next.mission_progress = None;
    Ok(next)
}

/// Active -> Failed -> Idle, only if `mission_id` is still the active mission
pub fn fail(team: &Team, mission_id: &str, reason: FailReason, now: Timestamp) -> Transition {
    let Ok((active, progress)) = active_parts(team) else {
        return Transition::Unchanged;
    };
    if active != mission_id {
        return Transition::Unchanged;
    }

    let mut next = team.clone();
    next.mission_failed.push(mission_id.to_string());
    next.mission_failed_progress.push(FailedMission {
        mission_id: mission_id.to_string(),
        failed_at: now,
        reason,
        mission_progress: progress.clone(),
    });
    next.active_mission_id = None;
    next.mission_progress = None;
    Transition::Updated(next)
}

/// Active -> Idle without archiving anywhere
pub fn abandon(team: &Team) -> Result<Team, MissionError> {
    active_parts(team)?;
    let mut next = team.clone();
    next.active_mission_id = None;
    next.mission_progress = None;
    Ok(next)
}

/// Remember that the team was told about a reminder boundary
pub fn record_reminder(team: &Team, mission_id: &str, minutes: u32) -> Transition {
    let Ok((active, progress)) = active_parts(team) else {
        return Transition::Unchanged;
    };
    if active != mission_id || progress.last_reminder_minutes.is_some_and(|last| last <= minutes) {
        return Transition::Unchanged;
    }

    let mut progress = progress.clone();
    progress.last_reminder_minutes = Some(minutes);
    let mut next = team.clone();
    next.mission_progress = Some(progress);
    Transition::Updated(next)
}

// ==================== COMMANDS ====================

/// Player and game-master operations on a team's mission
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MissionCommand<'a> {
    Start { mission_id: &'a str },
    Advance { checkpoint_id: &'a str, digit: Option<&'a str> },
    Complete { attempt: &'a str },
    Fail { mission_id: &'a str, reason: FailReason },
    Abandon,
}

/// Resolve `command` against the team's latest snapshot through the CAS loop
pub fn execute<S, C>(
    resolver: &CompletionResolver<'_, S>,
    catalog: &C,
    team_id: &str,
    command: MissionCommand<'_>,
    now: Timestamp,
) -> Result<Applied, MissionError>
where
    S: TeamStore,
    C: MissionCatalog,
{
    resolver.apply(team_id, |team| match command {
        MissionCommand::Start { mission_id } => {
            ensure_idle(team)?;
            let plan = catalog.plan(mission_id)?;
            start(team, &plan, now).map(Transition::Updated)
        }
        MissionCommand::Advance { checkpoint_id, digit } => {
            let (mission_id, _) = active_parts(team)?;
            let plan = catalog.plan(mission_id)?;
            advance(team, &plan, checkpoint_id, digit)
        }
        MissionCommand::Complete { attempt } => {
            let (mission_id, _) = active_parts(team)?;
            let plan = catalog.plan(mission_id)?;
            complete(team, &plan, attempt, now).map(Transition::Updated)
        }
        MissionCommand::Fail { mission_id, reason } => Ok(fail(team, mission_id, reason, now)),
        MissionCommand::Abandon => abandon(team).map(Transition::Updated),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{four_stop_plan, idle_team, ts, MemoryStore, StaticCatalog, MAX_ATTEMPTS};
    use std::sync::Barrier;

    fn started() -> Team {
        start(&idle_team("t1"), &four_stop_plan(), ts(0)).unwrap()
    }

    fn updated(t: Transition) -> Team {
        match t {
            Transition::Updated(team) => team,
            Transition::Unchanged => panic!("expected an update"),
        }
    }

    fn progress(team: &Team) -> &MissionProgress {
        team.mission_progress.as_ref().unwrap()
    }

    #[test]
    fn test_start_sets_head() {
        let team = started();
        assert_eq!(team.active_mission_id.as_deref(), Some("m1"));
        let p = progress(&team);
        assert_eq!(p.current_checkpoint_id.as_deref(), Some("A"));
        assert!(p.completed_checkpoint_ids.is_empty());
        assert!(p.collected_digits.is_empty());
        assert_eq!(p.started_at, ts(0));
    }

    #[test]
    fn test_start_while_active_is_rejected() {
        let team = started();
        let err = start(&team, &four_stop_plan(), ts(5)).unwrap_err();
        assert_eq!(
            err,
            MissionError::AlreadyActive { team_id: "t1".into(), mission_id: "m1".into() }
        );
    }

    #[test]
    fn test_start_empty_or_inactive_mission() {
        let plan = MissionPlan::new(crate::testkit::mission("empty", 30, "1"), Vec::new());
        assert_eq!(
            start(&idle_team("t1"), &plan, ts(0)).unwrap_err(),
            MissionError::EmptyMission("empty".into())
        );

        let mut plan = four_stop_plan();
        plan.mission.active = false;
        assert_eq!(
            start(&idle_team("t1"), &plan, ts(0)).unwrap_err(),
            MissionError::MissionInactive("m1".into())
        );
    }

    #[test]
    fn test_advance_moves_current_and_collects_digit() {
        let plan = four_stop_plan();
        let team = updated(advance(&started(), &plan, "A", Some("1")).unwrap());
        let p = progress(&team);
        assert_eq!(p.current_checkpoint_id.as_deref(), Some("B"));
        assert_eq!(p.digit_values(), vec!["1"]);
    }

    #[test]
    fn test_advance_without_digit_collects_declared_one() {
        let plan = four_stop_plan();
        let team = updated(advance(&started(), &plan, "A", None).unwrap());
        assert_eq!(progress(&team).digit_values(), vec!["12"]);

        let undeclared = MissionPlan::new(
            crate::testkit::mission("m1", 60, "1"),
            vec![
                crate::testkit::checkpoint("m1", "A", Some("B"), None),
                crate::testkit::checkpoint("m1", "B", None, Some((0, "1"))),
            ],
        );
        let team = updated(advance(&started(), &undeclared, "A", None).unwrap());
        assert!(progress(&team).collected_digits.is_empty());
    }

    #[test]
    fn test_advance_twice_is_idempotent() {
        let plan = four_stop_plan();
        let once = updated(advance(&started(), &plan, "A", Some("1")).unwrap());
        assert_eq!(advance(&once, &plan, "A", Some("1")).unwrap(), Transition::Unchanged);
    }

    #[test]
    fn test_advance_out_of_order_leaves_state() {
        let plan = four_stop_plan();
        let team = started();
        let before = team.clone();
        let err = advance(&team, &plan, "C", None).unwrap_err();
        assert_eq!(
            err,
            MissionError::OutOfOrder { requested: "C".into(), current: Some("A".into()) }
        );
        assert_eq!(team, before);
    }

    #[test]
    fn test_advance_unknown_checkpoint_or_idle_team() {
        let plan = four_stop_plan();
        assert!(matches!(
            advance(&started(), &plan, "Z", None).unwrap_err(),
            MissionError::NotFound { kind: RecordKind::Checkpoint, .. }
        ));
        assert_eq!(
            advance(&idle_team("t1"), &plan, "A", None).unwrap_err(),
            MissionError::NoActiveMission("t1".into())
        );
    }

    #[test]
    fn test_digits_read_sorted_by_position() {
        // Positions declared in reverse of traversal order: A=4 .. D=1
        let plan = crate::testkit::reversed_digit_plan();
        let mut team = started();
        for (cp, digit) in [("A", "4"), ("B", "3"), ("C", "2"), ("D", "1")] {
            team = updated(advance(&team, &plan, cp, Some(digit)).unwrap());
        }
        let p = progress(&team);
        assert_eq!(p.digit_values(), vec!["1", "2", "3", "4"]);
        assert_eq!(p.assembled_code(), "1234");
        assert_eq!(p.current_checkpoint_id, None);
    }

    #[test]
    fn test_undeclared_digit_follows_declared_ones() {
        // A is reached first but declares no position; B declares position 0
        let plan = MissionPlan::new(
            crate::testkit::mission("m1", 60, "YX"),
            vec![
                crate::testkit::checkpoint("m1", "A", Some("B"), None),
                crate::testkit::checkpoint("m1", "B", None, Some((0, "Y"))),
            ],
        );
        let team = updated(advance(&started(), &plan, "A", Some("X")).unwrap());
        let team = updated(advance(&team, &plan, "B", None).unwrap());
        let p = progress(&team);
        assert_eq!(p.assembled_code(), "YX");
        let positions: Vec<i32> = p.digits().iter().map(|d| d.position).collect();
        assert_eq!(positions, vec![0, 1]);
    }

    #[test]
    fn test_complete_requires_all_checkpoints() {
        let plan = four_stop_plan();
        let team = updated(advance(&started(), &plan, "A", Some("1")).unwrap());
        assert_eq!(
            complete(&team, &plan, "123456", ts(10)).unwrap_err(),
            MissionError::CheckpointsRemaining { remaining: 3 }
        );
    }

    fn finished_all() -> Team {
        let plan = four_stop_plan();
        let mut team = started();
        for (cp, digit) in [("A", "12"), ("B", "34"), ("C", "5"), ("D", "6")] {
            team = updated(advance(&team, &plan, cp, Some(digit)).unwrap());
        }
        team
    }

    #[test]
    fn test_complete_with_correct_password() {
        let plan = four_stop_plan();
        let team = complete(&finished_all(), &plan, "123456", ts(900)).unwrap();
        assert_eq!(team.active_mission_id, None);
        assert_eq!(team.mission_progress, None);
        assert_eq!(team.completed_missions, vec!["m1"]);
        let record = &team.completed_mission_progress[0];
        assert_eq!(record.completed_at, ts(900));
        assert_eq!(record.completed_checkpoint_ids, vec!["A", "B", "C", "D"]);
        assert!(team.mission_failed.is_empty());
    }

    #[test]
    fn test_complete_with_wrong_password_is_retryable() {
        let plan = four_stop_plan();
        let team = finished_all();
        for _ in 0..3 {
            assert_eq!(
                complete(&team, &plan, "123455", ts(900)).unwrap_err(),
                MissionError::IncorrectPassword
            );
        }
        // Case-sensitive exact match
        let mut plan = plan;
        plan.mission.password = "AbC".into();
        assert_eq!(
            complete(&team, &plan, "abc", ts(900)).unwrap_err(),
            MissionError::IncorrectPassword
        );
        assert!(complete(&team, &plan, "AbC", ts(900)).is_ok());
    }

    #[test]
    fn test_fail_archives_snapshot() {
        let plan = four_stop_plan();
        let team = updated(advance(&started(), &plan, "A", Some("1")).unwrap());
        let snapshot = progress(&team).clone();
        let failed = updated(fail(&team, "m1", FailReason::DeadlineExceeded, ts(3600)));
        assert_eq!(failed.active_mission_id, None);
        assert_eq!(failed.mission_failed, vec!["m1"]);
        let record = &failed.mission_failed_progress[0];
        assert_eq!(record.failed_at, ts(3600));
        assert_eq!(record.reason, FailReason::DeadlineExceeded);
        assert_eq!(record.mission_progress, snapshot);
    }

    #[test]
    fn test_fail_for_other_mission_is_noop() {
        assert_eq!(
            fail(&started(), "other", FailReason::Aborted, ts(1)),
            Transition::Unchanged
        );
        assert_eq!(
            fail(&idle_team("t1"), "m1", FailReason::Aborted, ts(1)),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_abandon_archives_nothing() {
        let team = abandon(&started()).unwrap();
        assert_eq!(team.active_mission_id, None);
        assert_eq!(team.mission_progress, None);
        assert!(team.completed_missions.is_empty());
        assert!(team.mission_failed.is_empty());
        assert!(matches!(
            abandon(&team).unwrap_err(),
            MissionError::NoActiveMission(_)
        ));
        // Team can start again
        assert!(start(&team, &four_stop_plan(), ts(50)).is_ok());
    }

    #[test]
    fn test_record_reminder_only_moves_down() {
        let team = updated(record_reminder(&started(), "m1", 45));
        assert_eq!(progress(&team).last_reminder_minutes, Some(45));
        assert_eq!(record_reminder(&team, "m1", 45), Transition::Unchanged);
        assert_eq!(record_reminder(&team, "m1", 60), Transition::Unchanged);
        let team = updated(record_reminder(&team, "m1", 30));
        assert_eq!(progress(&team).last_reminder_minutes, Some(30));
    }

    #[test]
    fn test_two_members_advance_same_checkpoint() {
        let store = MemoryStore::with_team(idle_team("t1"));
        let catalog = StaticCatalog::with_plan(four_stop_plan());
        let resolver = CompletionResolver::new(&store, MAX_ATTEMPTS);

        execute(&resolver, &catalog, "t1", MissionCommand::Start { mission_id: "m1" }, ts(0)).unwrap();
        execute(
            &resolver,
            &catalog,
            "t1",
            MissionCommand::Advance { checkpoint_id: "A", digit: Some("1") },
            ts(60),
        )
        .unwrap();

        let barrier = Barrier::new(2);
        let (store, catalog, barrier) = (&store, &catalog, &barrier);
        let results: Vec<Applied> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(move || {
                        barrier.wait();
                        let resolver = CompletionResolver::new(store, MAX_ATTEMPTS);
                        execute(
                            &resolver,
                            catalog,
                            "t1",
                            MissionCommand::Advance { checkpoint_id: "B", digit: Some("2") },
                            ts(120),
                        )
                        .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_committed()).count(), 1);
        let team = store.load("t1").unwrap();
        let p = progress(&team);
        assert_eq!(p.current_checkpoint_id.as_deref(), Some("C"));
        assert_eq!(p.completed_checkpoint_ids, vec!["A", "B"]);
        assert_eq!(p.digit_values(), vec!["1", "2"]);
        // Start + A + one B
        assert_eq!(team.version, 3);
    }

    #[test]
    fn test_execute_rejections_commit_nothing() {
        let store = MemoryStore::with_team(idle_team("t1"));
        let catalog = StaticCatalog::with_plan(four_stop_plan());
        let resolver = CompletionResolver::new(&store, MAX_ATTEMPTS);
        execute(&resolver, &catalog, "t1", MissionCommand::Start { mission_id: "m1" }, ts(0)).unwrap();
        let before = store.load("t1").unwrap();

        let err = execute(
            &resolver,
            &catalog,
            "t1",
            MissionCommand::Start { mission_id: "m1" },
            ts(1),
        )
        .unwrap_err();
        assert!(matches!(err, MissionError::AlreadyActive { .. }));

        let err = execute(
            &resolver,
            &catalog,
            "t1",
            MissionCommand::Advance { checkpoint_id: "D", digit: None },
            ts(1),
        )
        .unwrap_err();
        assert!(matches!(err, MissionError::OutOfOrder { .. }));

        let err = execute(
            &resolver,
            &catalog,
            "t1",
            MissionCommand::Start { mission_id: "ghost" },
            ts(1),
        )
        .unwrap_err();
        assert!(matches!(err, MissionError::AlreadyActive { .. }));

        assert_eq!(store.load("t1").unwrap(), before);
    }
}
