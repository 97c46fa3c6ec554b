// Concurrent completion resolver
// Every mutating team operation runs here: read snapshot, check precondition against it,
// commit only if nobody else committed in between, otherwise re-read and re-check.

use crate::error::{MissionError, RecordKind};
use crate::store::{CasFailure, TeamStore};
use crate::Team;

/// What an operation wants to do with the snapshot it was shown
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Precondition already satisfied (retransmission, stale timer), nothing to write
    Unchanged,
    Updated(Team),
}

/// Result of a resolved operation
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// This call's write won; carries the committed row
    Committed(Team),
    /// No write was needed; carries the snapshot that satisfied the operation
    Unchanged(Team),
}

impl Applied {
    pub fn team(&self) -> &Team {
        match self {
            Self::Committed(team) | Self::Unchanged(team) => team,
        }
    }

    pub fn into_team(self) -> Team {
        match self {
            Self::Committed(team) | Self::Unchanged(team) => team,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

pub struct CompletionResolver<'s, S> {
    store: &'s S,
    max_attempts: u32,
}

impl<'s, S: TeamStore> CompletionResolver<'s, S> {
    pub fn new(store: &'s S, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run `op` against the latest snapshot of `team_id` until its result commits.
    ///
    /// `op` is re-evaluated from scratch after every version mismatch, so a precondition that
    /// held on a stale snapshot is never committed. Errors from `op` abort without writing.
    pub fn apply<F>(&self, team_id: &str, mut op: F) -> Result<Applied, MissionError>
    where
        F: FnMut(&Team) -> Result<Transition, MissionError>,
    {
        for attempt in 1..=self.max_attempts {
            let snapshot = self
                .store
                .load(team_id)
                .ok_or_else(|| MissionError::not_found(RecordKind::Team, team_id))?;

            let next = match op(&snapshot)? {
                Transition::Unchanged => return Ok(Applied::Unchanged(snapshot)),
                Transition::Updated(next) => next,
            };

            match self.store.compare_and_set(next, snapshot.version) {
                Ok(committed) => return Ok(Applied::Committed(committed)),
                Err(CasFailure::VersionMismatch { expected, found }) => {
                    log::debug!(
                        "[CAS] retry team:{} attempt:{}/{} expected:v{} found:v{}",
                        team_id,
                        attempt,
                        self.max_attempts,
                        expected,
                        found
                    );
                }
                Err(CasFailure::Missing) => {
                    return Err(MissionError::not_found(RecordKind::Team, team_id));
                }
            }
        }

        log::warn!("[CAS] ✗ team:{} gave up after {} attempts", team_id, self.max_attempts);
        Err(MissionError::ConcurrencyConflict {
            team_id: team_id.to_string(),
            attempts: self.max_attempts,
        })
    }
}
