// Deadline monitor
// Any number of clients (plus the server schedule) tick this independently. Reminders and the
// deadline Fail both commit through the CAS loop, so each lands once per team.

use chrono::Duration;
use spacetimedb::Timestamp;

use crate::catalog::MissionCatalog;
use crate::error::MissionError;
use crate::progress::{self, FailReason, MissionProgress};
use crate::resolver::{CompletionResolver, Transition};
use crate::store::TeamStore;
use crate::REMINDER_INTERVAL_MINUTES;

const MICROS_PER_MINUTE: i64 = 60 * 1_000_000;

/// Wall-clock budget of one mission run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineClock {
    started_at: Timestamp,
    budget_minutes: u32,
}

impl DeadlineClock {
    pub fn new(started_at: Timestamp, estimated_duration_minutes: u32) -> Self {
        Self {
            started_at,
            budget_minutes: estimated_duration_minutes,
        }
    }

    pub fn for_progress(progress: &MissionProgress, estimated_duration_minutes: u32) -> Self {
        Self::new(progress.started_at, estimated_duration_minutes)
    }

    fn deadline_micros(&self) -> i64 {
        self.started_at.to_micros_since_unix_epoch() + self.budget_minutes as i64 * MICROS_PER_MINUTE
    }

    fn remaining_micros(&self, now: Timestamp) -> i64 {
        self.deadline_micros() - now.to_micros_since_unix_epoch()
    }

    /// startedAt + estimatedDurationMinutes
    pub fn deadline(&self) -> Timestamp {
        Timestamp::from_micros_since_unix_epoch(self.deadline_micros())
    }

    /// Signed: negative once the deadline has passed
    pub fn remaining(&self, now: Timestamp) -> Duration {
        Duration::microseconds(self.remaining_micros(now))
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.remaining_micros(now) <= 0
    }

    /// Lowest reminder boundary (in minutes remaining) already crossed at `now`.
    ///
    /// A boundary is crossed once remaining <= boundary. The boundary equal to or above the full
    /// budget is the moment of Start and never counts. None after expiry.
    pub fn reminder_boundary(&self, now: Timestamp) -> Option<u32> {
        let remaining = self.remaining_micros(now);
        if remaining <= 0 {
            return None;
        }
        let interval = REMINDER_INTERVAL_MINUTES as i64 * MICROS_PER_MINUTE;
        let steps = (remaining + interval - 1) / interval;
        let minutes = steps * REMINDER_INTERVAL_MINUTES as i64;
        if minutes >= self.budget_minutes as i64 {
            return None;
        }
        u32::try_from(minutes).ok()
    }

    /// When the next boundary or the deadline will be reached, whichever comes first
    pub fn next_check_at(&self, now: Timestamp) -> Timestamp {
        let remaining = self.remaining_micros(now);
        if remaining <= 0 {
            return now;
        }
        let interval = REMINDER_INTERVAL_MINUTES as i64 * MICROS_PER_MINUTE;
        let boundary = ((remaining - 1) / interval) * interval;
        Timestamp::from_micros_since_unix_epoch(self.deadline_micros() - boundary)
    }
}

/// mm:ss, clamped at zero
pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.num_seconds().max(0);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// What the clock says about one progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockReading {
    Running { remaining: Duration },
    ReminderDue { minutes: u32, remaining: Duration },
    Expired,
}

/// Pure function of the snapshot: safe to evaluate on any coalesced state
pub fn read_clock(progress: &MissionProgress, estimated_duration_minutes: u32, now: Timestamp) -> ClockReading {
    let clock = DeadlineClock::for_progress(progress, estimated_duration_minutes);
    if clock.is_expired(now) {
        return ClockReading::Expired;
    }
    let remaining = clock.remaining(now);
    match clock.reminder_boundary(now) {
        Some(minutes) if progress.last_reminder_minutes.map_or(true, |last| minutes < last) => {
            ClockReading::ReminderDue { minutes, remaining }
        }
        _ => ClockReading::Running { remaining },
    }
}

/// Result of one monitor tick, from this caller's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No active mission
    Idle,
    Running { mission_id: String, remaining: Duration },
    /// This tick committed the reminder
    Reminded { mission_id: String, minutes: u32 },
    /// This tick committed Fail(DeadlineExceeded)
    Expired { mission_id: String },
}

pub struct DeadlineMonitor<'r, 's, S> {
    resolver: &'r CompletionResolver<'s, S>,
}

impl<'r, 's, S: TeamStore> DeadlineMonitor<'r, 's, S> {
    pub fn new(resolver: &'r CompletionResolver<'s, S>) -> Self {
        Self { resolver }
    }

    /// Evaluate the team's clock and commit whatever it calls for.
    ///
    /// Each retry re-reads the clock from the fresh snapshot: a monitor that loses the race to
    /// another monitor sees the mission already failed (or the reminder already recorded) and
    /// reports what it observed instead of writing again.
    pub fn tick<C: MissionCatalog>(
        &self,
        team_id: &str,
        catalog: &C,
        now: Timestamp,
    ) -> Result<TickOutcome, MissionError> {
        let mut outcome = TickOutcome::Idle;

        self.resolver.apply(team_id, |team| {
            let (Some(mission_id), Some(running)) =
                (team.active_mission_id.as_deref(), team.mission_progress.as_ref())
            else {
                outcome = TickOutcome::Idle;
                return Ok(Transition::Unchanged);
            };
            let mission = catalog.mission(mission_id)?;

            match read_clock(running, mission.estimated_duration_minutes, now) {
                ClockReading::Running { remaining } => {
                    outcome = TickOutcome::Running {
                        mission_id: mission_id.to_string(),
                        remaining,
                    };
                    Ok(Transition::Unchanged)
                }
                ClockReading::ReminderDue { minutes, .. } => {
                    outcome = TickOutcome::Reminded {
                        mission_id: mission_id.to_string(),
                        minutes,
                    };
                    Ok(progress::record_reminder(team, mission_id, minutes))
                }
                ClockReading::Expired => {
                    outcome = TickOutcome::Expired {
                        mission_id: mission_id.to_string(),
                    };
                    Ok(progress::fail(team, mission_id, FailReason::DeadlineExceeded, now))
                }
            }
        })?;

        match &outcome {
            TickOutcome::Reminded { mission_id, minutes } => {
                log::info!("[CLOCK] reminder team:{} mission:{} remaining_min:{}", team_id, mission_id, minutes);
            }
            TickOutcome::Expired { mission_id } => {
                log::info!("[CLOCK] ✗ deadline exceeded team:{} mission:{}", team_id, mission_id);
            }
            _ => {}
        }
        Ok(outcome)
    }
}
