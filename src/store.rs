// Versioned team record access
// The team row is the only shared mutable state. Writers never update it blindly:
// they read a version and write back only if it is still that version.

use spacetimedb::ReducerContext;

use crate::{team, Team};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasFailure {
    /// Someone committed between our read and our write
    VersionMismatch { expected: u64, found: u64 },
    /// Row vanished between our read and our write
    Missing,
}

/// Document-store primitive the engine needs: keyed read plus version-checked write.
pub trait TeamStore {
    fn load(&self, team_id: &str) -> Option<Team>;

    /// Write `team` if the stored version still equals `expected_version`.
    /// Returns the committed row with its bumped version.
    fn compare_and_set(&self, team: Team, expected_version: u64) -> Result<Team, CasFailure>;
}

/// `team` table inside the current reducer transaction
pub struct TableStore<'a> {
    ctx: &'a ReducerContext,
}

impl<'a> TableStore<'a> {
    pub fn new(ctx: &'a ReducerContext) -> Self {
        Self { ctx }
    }
}

impl TeamStore for TableStore<'_> {
    fn load(&self, team_id: &str) -> Option<Team> {
        self.ctx.db.team().id().find(&team_id.to_string())
    }

    fn compare_and_set(&self, mut team: Team, expected_version: u64) -> Result<Team, CasFailure> {
        let stored = self
            .ctx
            .db
            .team()
            .id()
            .find(&team.id)
            .ok_or(CasFailure::Missing)?;

        if stored.version != expected_version {
            return Err(CasFailure::VersionMismatch {
                expected: expected_version,
                found: stored.version,
            });
        }

        team.version = expected_version + 1;
        self.ctx.db.team().id().update(team.clone());
        Ok(team)
    }
}
