// Unlock verifier
// The unlock code is a cooperative puzzle answer, not a credential: plain equality,
// unlimited attempts, no lockout.

use spacetimedb::Timestamp;

use crate::catalog::MissionCatalog;
use crate::error::MissionError;
use crate::progress::{execute, MissionCommand};
use crate::resolver::{Applied, CompletionResolver};
use crate::store::TeamStore;

/// Exact, case-sensitive comparison against the mission's unlock code
pub fn verify_code(expected: &str, attempt: &str) -> Result<(), MissionError> {
    if attempt == expected {
        Ok(())
    } else {
        Err(MissionError::IncorrectPassword)
    }
}

/// Submit a team's unlock attempt; a match completes the active mission
pub fn submit<S, C>(
    resolver: &CompletionResolver<'_, S>,
    catalog: &C,
    team_id: &str,
    attempt: &str,
    now: Timestamp,
) -> Result<Applied, MissionError>
where
    S: TeamStore,
    C: MissionCatalog,
{
    let applied = execute(resolver, catalog, team_id, MissionCommand::Complete { attempt }, now)?;
    if let Some(record) = applied.team().completed_mission_progress.last() {
        log::info!(
            "[UNLOCK] ✓ team:{} mission:{} digits:{}",
            team_id,
            record.mission_id,
            record.collected_digits.len()
        );
    }
    Ok(applied)
}
