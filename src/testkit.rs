// Test fixtures: in-memory team store with latest-snapshot subscriptions, a static catalog,
// and the A -> B -> C -> D mission most tests play through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use spacetimedb::Timestamp;

use crate::catalog::{MissionCatalog, MissionPlan};
use crate::error::{MissionError, RecordKind};
use crate::store::{CasFailure, TeamStore};
use crate::{ChallengeType, Checkpoint, Mission, PasswordDigit, Team};

pub const MAX_ATTEMPTS: u32 = 5;

pub fn ts(secs: i64) -> Timestamp {
    Timestamp::from_micros_since_unix_epoch(secs * 1_000_000)
}

pub fn idle_team(id: &str) -> Team {
    Team {
        id: id.to_string(),
        name: format!("Team {}", id),
        members: Vec::new(),
        version: 0,
        active_mission_id: None,
        mission_progress: None,
        completed_missions: Vec::new(),
        completed_mission_progress: Vec::new(),
        mission_failed: Vec::new(),
        mission_failed_progress: Vec::new(),
        created_at: ts(0),
    }
}

pub fn mission(id: &str, minutes: u32, password: &str) -> Mission {
    Mission {
        id: id.to_string(),
        title: format!("Mission {}", id),
        estimated_duration_minutes: minutes,
        password: password.to_string(),
        start_location: None,
        end_location: None,
        active: true,
    }
}

pub fn checkpoint(mission_id: &str, id: &str, next: Option<&str>, digit: Option<(i32, &str)>) -> Checkpoint {
    Checkpoint {
        id: id.to_string(),
        mission_id: mission_id.to_string(),
        name: format!("Checkpoint {}", id),
        challenge_type: ChallengeType::Puzzle,
        challenge: "{}".to_string(),
        password_digit: digit.map(|(position, value)| PasswordDigit {
            position,
            value: value.to_string(),
        }),
        next_checkpoint_id: next.map(str::to_string),
        location: None,
    }
}

fn chain(positions: [(i32, &str); 4]) -> MissionPlan {
    let ids = ["A", "B", "C", "D"];
    // Shuffled on purpose; order comes from the links
    let checkpoints = [2, 0, 3, 1]
        .into_iter()
        .map(|i| checkpoint("m1", ids[i], ids.get(i + 1).copied(), Some(positions[i])))
        .collect();
    MissionPlan::new(mission("m1", 60, "123456"), checkpoints)
}

/// m1: 60 minutes, code "123456", A -> B -> C -> D with positions 0..3
pub fn four_stop_plan() -> MissionPlan {
    chain([(0, "12"), (1, "34"), (2, "5"), (3, "6")])
}

/// Same chain, digit positions declared in reverse of traversal order
pub fn reversed_digit_plan() -> MissionPlan {
    chain([(4, "4"), (3, "3"), (2, "2"), (1, "1")])
}

// ==================== CATALOG ====================

#[derive(Debug, Default)]
pub struct StaticCatalog {
    plans: HashMap<String, MissionPlan>,
}

impl StaticCatalog {
    pub fn with_plan(plan: MissionPlan) -> Self {
        let mut catalog = Self::default();
        catalog.plans.insert(plan.mission.id.clone(), plan);
        catalog
    }
}

impl MissionCatalog for StaticCatalog {
    fn mission(&self, mission_id: &str) -> Result<Mission, MissionError> {
        self.plans
            .get(mission_id)
            .map(|plan| plan.mission.clone())
            .ok_or_else(|| MissionError::not_found(RecordKind::Mission, mission_id))
    }

    fn checkpoints(&self, mission_id: &str) -> Vec<Checkpoint> {
        self.plans
            .get(mission_id)
            .map(|plan| plan.ordered_checkpoints().cloned().collect())
            .unwrap_or_default()
    }
}

// ==================== STORE ====================

/// Receives only the newest committed snapshot; intermediate commits are overwritten
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    slot: Arc<Mutex<Option<Team>>>,
}

impl Subscription {
    /// Latest snapshot since the previous take, if any commit happened
    pub fn take(&self) -> Option<Team> {
        self.slot.lock().unwrap().take()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    teams: Mutex<HashMap<String, Team>>,
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl MemoryStore {
    pub fn with_team(team: Team) -> Self {
        let store = Self::default();
        store.teams.lock().unwrap().insert(team.id.clone(), team);
        store
    }

    pub fn subscribe(&self, team_id: &str) -> Subscription {
        let subscription = Subscription::default();
        self.subscribers
            .lock()
            .unwrap()
            .entry(team_id.to_string())
            .or_default()
            .push(subscription.clone());
        subscription
    }

    fn publish(&self, team: &Team) {
        if let Some(subscriptions) = self.subscribers.lock().unwrap().get(&team.id) {
            for subscription in subscriptions {
                *subscription.slot.lock().unwrap() = Some(team.clone());
            }
        }
    }
}

impl TeamStore for MemoryStore {
    fn load(&self, team_id: &str) -> Option<Team> {
        self.teams.lock().unwrap().get(team_id).cloned()
    }

    fn compare_and_set(&self, mut team: Team, expected_version: u64) -> Result<Team, CasFailure> {
        let committed = {
            let mut teams = self.teams.lock().unwrap();
            let stored = teams.get_mut(&team.id).ok_or(CasFailure::Missing)?;
            if stored.version != expected_version {
                return Err(CasFailure::VersionMismatch {
                    expected: expected_version,
                    found: stored.version,
                });
            }
            team.version = expected_version + 1;
            *stored = team.clone();
            team
        };
        self.publish(&committed);
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::{read_clock, ClockReading};
    use crate::progress::{execute, MissionCommand};
    use crate::resolver::CompletionResolver;

    #[test]
    fn test_subscription_coalesces_to_latest() {
        let store = MemoryStore::with_team(idle_team("t1"));
        let catalog = StaticCatalog::with_plan(four_stop_plan());
        let resolver = CompletionResolver::new(&store, MAX_ATTEMPTS);
        let sub = store.subscribe("t1");
        assert_eq!(sub.take(), None);

        execute(&resolver, &catalog, "t1", MissionCommand::Start { mission_id: "m1" }, ts(0)).unwrap();
        for (cp, digit) in [("A", "12"), ("B", "34")] {
            execute(
                &resolver,
                &catalog,
                "t1",
                MissionCommand::Advance { checkpoint_id: cp, digit: Some(digit) },
                ts(60),
            )
            .unwrap();
        }

        // Three commits, one delivery: the latest
        let latest = sub.take().unwrap();
        assert_eq!(latest.version, 3);
        assert_eq!(sub.take(), None);

        // Consumers only need that snapshot
        let progress = latest.mission_progress.as_ref().unwrap();
        assert_eq!(progress.current_checkpoint_id.as_deref(), Some("C"));
        assert_eq!(progress.assembled_code(), "1234");
        assert!(matches!(read_clock(progress, 60, ts(120)), ClockReading::Running { .. }));
    }

    #[test]
    fn test_subscription_is_per_team() {
        let store = MemoryStore::with_team(idle_team("t1"));
        store.teams.lock().unwrap().insert("t2".into(), idle_team("t2"));
        let sub = store.subscribe("t2");
        let resolver = CompletionResolver::new(&store, MAX_ATTEMPTS);
        resolver
            .apply("t1", |team| {
                let mut next = team.clone();
                next.name.push('?');
                Ok(crate::resolver::Transition::Updated(next))
            })
            .unwrap();
        assert_eq!(sub.take(), None);
    }

    #[test]
    fn test_rejected_cas_publishes_nothing() {
        let store = MemoryStore::with_team(idle_team("t1"));
        let sub = store.subscribe("t1");
        let err = store.compare_and_set(idle_team("t1"), 7).unwrap_err();
        assert_eq!(err, CasFailure::VersionMismatch { expected: 7, found: 0 });
        assert_eq!(sub.take(), None);
    }
}
