use std::collections::HashMap;

use spacetimedb::{
    ReducerContext, Identity, Table, Timestamp, ScheduleAt,
    table, reducer, view, SpacetimeType, rand::Rng,
};

pub mod catalog;
pub mod checkpoint_order;
pub mod deadline;
pub mod error;
pub mod feed;
pub mod import;
pub mod presence;
pub mod progress;
pub mod resolver;
pub mod roster;
pub mod store;
pub mod unlock;

#[cfg(test)]
mod testkit;

use catalog::{MissionCatalog, MissionPlan, TableCatalog};
use deadline::{format_remaining, DeadlineClock, DeadlineMonitor, TickOutcome};
use error::{log_rejection, MissionError, RecordKind};
use feed::{normalize_message, NotificationFeed};
use presence::{GeoPoint, MemberGuidance};
use progress::{execute, CompletedMission, FailReason, FailedMission, MissionCommand, MissionProgress};
use resolver::{Applied, CompletionResolver};
use roster::{MemberRole, MemberStatus, TeamMember};
use store::{TableStore, TeamStore};

// ==================== CONSTANTS ====================

/// Maximum members per team
const MAX_TEAM_MEMBERS: usize = 10;

/// Length of generated team codes (also the team id)
const TEAM_CODE_LEN: usize = 6;

/// Optimistic write attempts before an operation reports ConcurrencyConflict
const MAX_CAS_ATTEMPTS: u32 = 5;

/// Deadline reminders fire at every multiple of this many minutes remaining
const REMINDER_INTERVAL_MINUTES: u32 = 15;

/// Longest game-master message accepted into a team feed (characters)
const MAX_NOTIFICATION_LEN: usize = 500;

/// Longest display name (characters)
const MAX_DISPLAY_NAME_LEN: usize = 32;

// ==================== HELPER FUNCTIONS ====================

/// Get member from session using the sender's identity
fn get_member(ctx: &ReducerContext) -> Result<Member, String> {
    let session = ctx.db.session()
        .connection_id()
        .find(&ctx.sender)
        .ok_or("No session found".to_string())?;

    ctx.db.member()
        .user_id()
        .find(&session.user_id)
        .ok_or("Member not found".to_string())
}

/// Member plus the team they currently belong to
fn get_member_team(ctx: &ReducerContext) -> Result<(Member, String), String> {
    let member = get_member(ctx)?;
    let team_id = member.team_id.clone().ok_or("Not in a team".to_string())?;
    Ok((member, team_id))
}

/// Only identities in authorized_worker may call admin reducers
fn require_worker(ctx: &ReducerContext, action: &str) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized {} attempt by {}", action, ctx.sender);
        return Err("Unauthorized".to_string());
    }
    Ok(())
}

/// Short id prefix for logs
fn short(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(i, _)| &id[..i])
}

/// Run one mission command for a team through the CAS resolver
fn run_command(
    ctx: &ReducerContext,
    tag: &str,
    team_id: &str,
    command: MissionCommand<'_>,
) -> Result<Applied, String> {
    let store = TableStore::new(ctx);
    let catalog = TableCatalog::new(ctx);
    let resolver = CompletionResolver::new(&store, MAX_CAS_ATTEMPTS);
    execute(&resolver, &catalog, team_id, command, ctx.timestamp).map_err(|e| {
        log_rejection(tag, team_id, &e);
        e.to_string()
    })
}

/// Roster change through the CAS resolver
fn update_roster<F>(ctx: &ReducerContext, team_id: &str, op: F) -> Result<Applied, MissionError>
where
    F: FnMut(&Team) -> Result<resolver::Transition, MissionError>,
{
    let store = TableStore::new(ctx);
    CompletionResolver::new(&store, MAX_CAS_ATTEMPTS).apply(team_id, op)
}

/// Generate a team code, retrying on collision
fn generate_team_code(ctx: &ReducerContext) -> Result<String, String> {
    // Avoid confusing letters (no I, O, 0, 1)
    const CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = ctx.rng();
    for _ in 0..16 {
        let code: String = (0..TEAM_CODE_LEN)
            .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
            .collect();
        if ctx.db.team().id().find(&code).is_none() {
            return Ok(code);
        }
    }
    Err("Could not allocate a team code".to_string())
}

/// Cancel pending clock checks for a team (idempotent)
fn cancel_clock_checks(ctx: &ReducerContext, team_id: &str) {
    for schedule in ctx.db.mission_clock_schedule().iter().filter(|s| s.team_id == team_id) {
        ctx.db.mission_clock_schedule().id().delete(&schedule.id);
    }
}

/// Replace the team's clock check with one at the next reminder boundary or the deadline
fn schedule_clock_check(ctx: &ReducerContext, team: &Team) {
    cancel_clock_checks(ctx, &team.id);

    let (Some(mission_id), Some(running)) = (&team.active_mission_id, &team.mission_progress) else {
        return;
    };
    let Some(mission) = ctx.db.mission().id().find(mission_id) else {
        log::warn!("[CLOCK] team:{} mission:{} missing, no check scheduled", team.id, mission_id);
        return;
    };

    let at = DeadlineClock::for_progress(running, mission.estimated_duration_minutes).next_check_at(ctx.timestamp);
    ctx.db.mission_clock_schedule().insert(MissionClockSchedule {
        id: 0,
        team_id: team.id.clone(),
        mission_id: mission_id.clone(),
        scheduled_at: ScheduleAt::Time(at.into()),
    });
}

/// One deadline tick for a team; keeps the server schedule in step with the outcome
fn tick_clock(ctx: &ReducerContext, team_id: &str) -> Result<TickOutcome, String> {
    let store = TableStore::new(ctx);
    let catalog = TableCatalog::new(ctx);
    let resolver = CompletionResolver::new(&store, MAX_CAS_ATTEMPTS);
    let outcome = DeadlineMonitor::new(&resolver)
        .tick(team_id, &catalog, ctx.timestamp)
        .map_err(|e| {
            log_rejection("[CLOCK]", team_id, &e);
            e.to_string()
        })?;

    match &outcome {
        TickOutcome::Idle | TickOutcome::Expired { .. } => cancel_clock_checks(ctx, team_id),
        TickOutcome::Running { .. } | TickOutcome::Reminded { .. } => {}
    }
    Ok(outcome)
}

// ==================== TABLES ====================

/// Session links ephemeral connection to stable user
/// PRIVATE: created by the gateway after it authenticates the user
#[table(name = session)]
pub struct Session {
    #[primary_key]
    pub connection_id: Identity,

    /// Stable user id - verified by gateway
    pub user_id: String,

    pub connected_at: Timestamp,
}

/// Authorized identities that can call admin reducers (gateway, game master, authoring tool)
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

/// User profile
/// PRIVATE: teammates see the embedded roster and member_location instead
#[table(name = member)]
#[derive(Clone)]
pub struct Member {
    #[primary_key]
    pub user_id: String,

    pub display_name: String,

    /// Emoji or avatar key
    pub avatar: String,

    pub team_id: Option<String>,

    pub last_seen: Timestamp,
}

/// Shared team record. The only mutable state players contend on; every write bumps
/// `version` through the CAS resolver.
#[table(name = team, public)]
#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    /// Join code, TEAM_CODE_LEN characters
    #[primary_key]
    pub id: String,

    pub name: String,

    /// In join order; exactly one Leader while non-empty
    pub members: Vec<TeamMember>,

    pub version: u64,

    pub active_mission_id: Option<String>,

    /// Present exactly when active_mission_id is
    pub mission_progress: Option<MissionProgress>,

    pub completed_missions: Vec<String>,
    pub completed_mission_progress: Vec<CompletedMission>,

    pub mission_failed: Vec<String>,
    pub mission_failed_progress: Vec<FailedMission>,

    pub created_at: Timestamp,
}

/// Authored mission (read-only during play)
#[table(name = mission, public)]
#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    #[primary_key]
    pub id: String,

    pub title: String,

    /// Wall-clock budget from Start
    pub estimated_duration_minutes: u32,

    /// Cooperative puzzle answer, compared exactly
    pub password: String,

    pub start_location: Option<GeoPoint>,
    pub end_location: Option<GeoPoint>,

    /// Closed missions cannot be started
    pub active: bool,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    Physical,
    Puzzle,
    Photo,
    Quiz,
}

/// Digit a checkpoint contributes to the unlock code
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct PasswordDigit {
    pub position: i32,
    pub value: String,
}

/// Authored checkpoint. Traversal order comes from next_checkpoint_id links.
#[table(name = checkpoint, public)]
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    #[primary_key]
    pub id: String,

    #[index(btree)]
    pub mission_id: String,

    pub name: String,

    pub challenge_type: ChallengeType,

    /// JSON payload for the challenge UI; the engine never reads it
    pub challenge: String,

    pub password_digit: Option<PasswordDigit>,

    pub next_checkpoint_id: Option<String>,

    pub location: Option<GeoPoint>,
}

/// Game-master messages to a team. Append-only.
#[table(name = team_notification, public)]
#[derive(Debug, Clone, PartialEq)]
pub struct TeamNotification {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub team_id: String,

    pub message: String,

    pub created_at: Timestamp,
}

/// Last known position per member
#[table(name = member_location, public)]
#[derive(Debug, Clone, PartialEq)]
pub struct MemberLocation {
    #[primary_key]
    pub user_id: String,

    #[index(btree)]
    pub team_id: String,

    pub display_name: String,
    pub avatar: String,

    pub position: GeoPoint,

    /// Capture time of the sample
    pub updated_at: Timestamp,
}

/// Server-side deadline check for a team's active mission
#[table(name = mission_clock_schedule, scheduled(check_mission_clock))]
pub struct MissionClockSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub team_id: String,

    /// Mission active when the check was scheduled (for logs)
    pub mission_id: String,

    pub scheduled_at: ScheduleAt,
}

// ==================== VIEWS ====================

/// View: the caller's team
#[view(name = my_team, public)]
fn my_team(ctx: &spacetimedb::ViewContext) -> Option<Team> {
    let session = ctx.db.session().connection_id().find(ctx.sender)?;
    let member = ctx.db.member().user_id().find(&session.user_id)?;
    ctx.db.team().id().find(&member.team_id?)
}

/// View: distance and bearing from each teammate to the team's next waypoint.
/// Re-evaluated whenever the team row or a member location changes.
#[view(name = my_team_guidance, public)]
fn my_team_guidance(ctx: &spacetimedb::ViewContext) -> Vec<MemberGuidance> {
    let Some(team) = ctx.db.session()
        .connection_id()
        .find(ctx.sender)
        .and_then(|session| ctx.db.member().user_id().find(&session.user_id))
        .and_then(|member| member.team_id)
        .and_then(|team_id| ctx.db.team().id().find(&team_id))
    else {
        return Vec::new();
    };
    let positions: HashMap<String, GeoPoint> = ctx.db.member_location()
        .team_id()
        .filter(&team.id)
        .map(|loc| (loc.user_id, loc.position))
        .collect();
    let plan = team.active_mission_id.as_ref().and_then(|mission_id| {
        let mission = ctx.db.mission().id().find(mission_id)?;
        let checkpoints = ctx.db.checkpoint().mission_id().filter(mission_id).collect();
        Some(MissionPlan::new(mission, checkpoints))
    });
    presence::team_guidance(&team, plan.as_ref(), &positions)
}

/// View: the caller's team feed, oldest first
#[view(name = my_team_feed, public)]
fn my_team_feed(ctx: &spacetimedb::ViewContext) -> Vec<TeamNotification> {
    let Some(team_id) = ctx.db.session()
        .connection_id()
        .find(ctx.sender)
        .and_then(|session| ctx.db.member().user_id().find(&session.user_id))
        .and_then(|member| member.team_id)
    else {
        return Vec::new();
    };
    NotificationFeed::from_rows(ctx.db.team_notification().team_id().filter(&team_id))
        .entries()
        .to_vec()
}

/// View: most recent message in the caller's team feed
#[view(name = my_latest_notification, public)]
fn my_latest_notification(ctx: &spacetimedb::ViewContext) -> Option<TeamNotification> {
    let session = ctx.db.session().connection_id().find(ctx.sender)?;
    let team_id = ctx.db.member().user_id().find(&session.user_id)?.team_id?;
    NotificationFeed::from_rows(ctx.db.team_notification().team_id().filter(&team_id))
        .latest()
        .cloned()
}

// ==================== SESSION & MEMBERS ====================

/// Create a verified session for a client identity
/// Called by the gateway AFTER it authenticates the user
#[reducer]
pub fn create_session(ctx: &ReducerContext, client_identity: String, user_id: String) -> Result<(), String> {
    require_worker(ctx, "create_session")?;

    let identity = Identity::from_hex(&client_identity)
        .map_err(|e| format!("Invalid identity hex string: {}", e))?;

    // Delete stale sessions: same user (unclean reconnect) OR same connection_id (prevents PK conflict)
    let stale_sessions: Vec<_> = ctx.db.session()
        .iter()
        .filter(|s| s.user_id == user_id || s.connection_id == identity)
        .map(|s| s.connection_id)
        .collect();
    for conn_id in stale_sessions {
        ctx.db.session().connection_id().delete(&conn_id);
    }

    ctx.db.session().insert(Session {
        connection_id: identity,
        user_id: user_id.clone(),
        connected_at: ctx.timestamp,
    });

    log::info!("[SESSION] created user:{} ws:{}", short(&user_id), short(&client_identity));
    Ok(())
}

/// Mark the member Offline and drop the session
#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    let Some(session) = ctx.db.session().connection_id().find(&ctx.sender) else {
        return;
    };

    if let Some(mut member) = ctx.db.member().user_id().find(&session.user_id) {
        let session_min = ctx.timestamp.duration_since(session.connected_at)
            .map(|d| d.as_secs_f32() / 60.0)
            .unwrap_or(0.0);
        log::info!("[SESSION] disconnect user:{} session_min:{:.1} team:{:?}",
            short(&member.user_id), session_min, member.team_id);

        if let Some(team_id) = &member.team_id {
            let user_id = member.user_id.clone();
            match update_roster(ctx, team_id, |team| {
                Ok(roster::set_status(team, &user_id, MemberStatus::Offline))
            }) {
                Ok(applied) => {
                    let team = applied.team();
                    log::debug!("[PRESENCE] team:{} online:{}/{}",
                        team_id, roster::online_count(team), team.members.len());
                }
                Err(e) => log_rejection("[PRESENCE]", team_id, &e),
            }
        }

        member.last_seen = ctx.timestamp;
        ctx.db.member().user_id().update(member);
    }

    ctx.db.session().connection_id().delete(&ctx.sender);
}

/// Create or refresh the caller's profile and mark them Online in their team
#[reducer]
pub fn register_member(ctx: &ReducerContext, display_name: String, avatar: String) -> Result<(), String> {
    let session = ctx.db.session()
        .connection_id()
        .find(&ctx.sender)
        .ok_or("No session found - verify with gateway first".to_string())?;

    let display_name = display_name.trim().to_string();
    if display_name.is_empty() || display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(format!("Display name must be 1-{} characters", MAX_DISPLAY_NAME_LEN));
    }

    let member = match ctx.db.member().user_id().find(&session.user_id) {
        Some(mut existing) => {
            existing.display_name = display_name;
            existing.avatar = avatar;
            existing.last_seen = ctx.timestamp;
            ctx.db.member().user_id().update(existing)
        }
        None => ctx.db.member().insert(Member {
            user_id: session.user_id.clone(),
            display_name,
            avatar,
            team_id: None,
            last_seen: ctx.timestamp,
        }),
    };

    if let Some(team_id) = &member.team_id {
        update_roster(ctx, team_id, |team| {
            Ok(roster::set_status(team, &member.user_id, MemberStatus::Online))
        })
        .map_err(|e| {
            log_rejection("[PRESENCE]", team_id, &e);
            e.to_string()
        })?;
    }

    log::info!("[SESSION] member {} user:{} team:{:?}", member.display_name, short(&member.user_id), member.team_id);
    Ok(())
}

// ==================== TEAMS ====================

/// Create a team with a generated join code; the caller becomes its Leader
#[reducer]
pub fn create_team(ctx: &ReducerContext, name: String) -> Result<(), String> {
    let mut member = get_member(ctx)?;
    if let Some(team_id) = &member.team_id {
        return Err(format!("Already in team {}", team_id));
    }
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err("Team name required".to_string());
    }

    let code = generate_team_code(ctx)?;
    ctx.db.team().insert(Team {
        id: code.clone(),
        name: name.clone(),
        members: vec![TeamMember::new(&member.user_id, MemberRole::Leader)],
        version: 0,
        active_mission_id: None,
        mission_progress: None,
        completed_missions: Vec::new(),
        completed_mission_progress: Vec::new(),
        mission_failed: Vec::new(),
        mission_failed_progress: Vec::new(),
        created_at: ctx.timestamp,
    });

    member.team_id = Some(code.clone());
    let leader = member.display_name.clone();
    ctx.db.member().user_id().update(member);

    log::info!("[TEAM] created code:{} name:{} leader:{}", code, name, leader);
    Ok(())
}

/// Join a team by code
#[reducer]
pub fn join_team(ctx: &ReducerContext, team_id: String) -> Result<(), String> {
    let team_id = team_id.trim().to_uppercase();
    if team_id.len() != TEAM_CODE_LEN {
        log::warn!("Invalid team code format: '{}' from {}", team_id, ctx.sender);
        return Err("Invalid team code".to_string());
    }

    let mut member = get_member(ctx)?;
    match &member.team_id {
        Some(current) if *current != team_id => return Err(format!("Already in team {}", current)),
        _ => {}
    }

    let user_id = member.user_id.clone();
    let applied = update_roster(ctx, &team_id, |team| roster::join(team, &user_id, MAX_TEAM_MEMBERS))
        .map_err(|e| {
            log_rejection("[TEAM]", &team_id, &e);
            e.to_string()
        })?;

    member.team_id = Some(team_id.clone());
    let name = member.display_name.clone();
    ctx.db.member().user_id().update(member);

    log::info!("[TEAM] joined code:{} member:{} size:{}/{}",
        team_id, name, applied.team().members.len(), MAX_TEAM_MEMBERS);
    Ok(())
}

/// Leave the current team. Only while no mission is active.
#[reducer]
pub fn leave_team(ctx: &ReducerContext) -> Result<(), String> {
    let (mut member, team_id) = get_member_team(ctx)?;

    let user_id = member.user_id.clone();
    let applied = update_roster(ctx, &team_id, |team| roster::leave(team, &user_id))
        .map_err(|e| {
            log_rejection("[TEAM]", &team_id, &e);
            e.to_string()
        })?;

    member.team_id = None;
    let name = member.display_name.clone();
    ctx.db.member().user_id().update(member);
    ctx.db.member_location().user_id().delete(&user_id);

    log::info!("[TEAM] left code:{} member:{} remaining:{}", team_id, name, applied.team().members.len());
    Ok(())
}

// ==================== AUTHORING ====================

/// Open or close a mission for play. Running missions are unaffected.
#[reducer]
pub fn set_mission_active(ctx: &ReducerContext, mission_id: String, active: bool) -> Result<(), String> {
    require_worker(ctx, "set_mission_active")?;

    let mut mission = ctx.db.mission().id().find(&mission_id)
        .ok_or_else(|| MissionError::not_found(RecordKind::Mission, &mission_id).to_string())?;
    mission.active = active;
    ctx.db.mission().id().update(mission);

    log::info!("[IMPORT] mission:{} active:{}", mission_id, active);
    Ok(())
}

// ==================== MISSION PLAY ====================

/// Start a mission for the caller's team
#[reducer]
pub fn start_mission(ctx: &ReducerContext, mission_id: String) -> Result<(), String> {
    let (member, team_id) = get_member_team(ctx)?;

    let applied = run_command(ctx, "[MISSION]", &team_id, MissionCommand::Start { mission_id: &mission_id })?;
    let team = applied.team();
    schedule_clock_check(ctx, team);

    let budget = ctx.db.mission().id().find(&mission_id).map_or(0, |m| m.estimated_duration_minutes);
    let checkpoints = ctx.db.checkpoint().mission_id().filter(&mission_id).count();
    log::info!("[MISSION] ✓ start team:{} mission:{} by:{} checkpoints:{} budget_min:{}",
        team_id, mission_id, member.display_name, checkpoints, budget);
    Ok(())
}

/// Record a checkpoint the caller's team has solved.
/// Without an explicit digit the checkpoint's declared digit is collected.
#[reducer]
pub fn complete_checkpoint(ctx: &ReducerContext, checkpoint_id: String, digit: Option<String>) -> Result<(), String> {
    let (member, team_id) = get_member_team(ctx)?;

    let applied = run_command(
        ctx,
        "[CHECKPOINT]",
        &team_id,
        MissionCommand::Advance { checkpoint_id: &checkpoint_id, digit: digit.as_deref() },
    )?;

    match &applied {
        Applied::Committed(team) => {
            let Some(progress) = &team.mission_progress else { return Ok(()); };
            log::info!("[CHECKPOINT] ✓ team:{} checkpoint:{} by:{} done:{} next:{:?} digits:{}",
                team_id, checkpoint_id, member.display_name,
                progress.completed_checkpoint_ids.len(),
                progress.current_checkpoint_id,
                progress.collected_digits.len());
        }
        Applied::Unchanged(_) => {
            log::debug!("[CHECKPOINT] duplicate team:{} checkpoint:{}", team_id, checkpoint_id);
        }
    }
    Ok(())
}

/// Try the assembled unlock code; a match completes the mission
#[reducer]
pub fn submit_unlock_password(ctx: &ReducerContext, password: String) -> Result<(), String> {
    let (member, team_id) = get_member_team(ctx)?;

    let store = TableStore::new(ctx);
    let catalog = TableCatalog::new(ctx);
    let resolver = CompletionResolver::new(&store, MAX_CAS_ATTEMPTS);
    let started_at = store
        .load(&team_id)
        .and_then(|team| team.mission_progress)
        .map(|p| p.started_at);

    unlock::submit(&resolver, &catalog, &team_id, &password, ctx.timestamp).map_err(|e| {
        log_rejection("[UNLOCK]", &team_id, &e);
        e.to_string()
    })?;
    cancel_clock_checks(ctx, &team_id);

    let elapsed_min = started_at
        .and_then(|t| ctx.timestamp.duration_since(t))
        .map(|d| d.as_secs_f32() / 60.0)
        .unwrap_or(0.0);
    log::info!("[MISSION] ✓ completed team:{} by:{} elapsed_min:{:.1}", team_id, member.display_name, elapsed_min);
    Ok(())
}

/// Give up the active mission without archiving it
#[reducer]
pub fn abandon_mission(ctx: &ReducerContext) -> Result<(), String> {
    let (member, team_id) = get_member_team(ctx)?;

    run_command(ctx, "[MISSION]", &team_id, MissionCommand::Abandon)?;
    cancel_clock_checks(ctx, &team_id);

    log::info!("[MISSION] abandoned team:{} by:{}", team_id, member.display_name);
    Ok(())
}

/// Client-driven deadline check (any member, ~1 Hz)
#[reducer]
pub fn tick_mission_clock(ctx: &ReducerContext) -> Result<(), String> {
    let (_, team_id) = get_member_team(ctx)?;
    if let TickOutcome::Running { mission_id, remaining } = tick_clock(ctx, &team_id)? {
        log::debug!("[CLOCK] team:{} mission:{} remaining:{}", team_id, mission_id, format_remaining(remaining));
    }
    Ok(())
}

/// Server-side deadline check (scheduled reducer)
#[reducer]
pub fn check_mission_clock(ctx: &ReducerContext, schedule: MissionClockSchedule) {
    // Only allow scheduler to call this, not clients
    if ctx.sender != ctx.identity() {
        log::warn!("Client {} attempted to call check_mission_clock", ctx.sender);
        return;
    }

    // Clean up schedule row after handling event
    ctx.db.mission_clock_schedule().id().delete(&schedule.id);

    match tick_clock(ctx, &schedule.team_id) {
        Ok(TickOutcome::Running { .. } | TickOutcome::Reminded { .. }) => {
            if let Some(team) = ctx.db.team().id().find(&schedule.team_id) {
                schedule_clock_check(ctx, &team);
            }
        }
        Ok(TickOutcome::Idle | TickOutcome::Expired { .. }) => {}
        Err(e) => log::warn!("[CLOCK] scheduled check team:{} mission:{} failed: {}",
            schedule.team_id, schedule.mission_id, e),
    }
}

/// Game master ends a team's mission as failed
#[reducer]
pub fn admin_fail_mission(ctx: &ReducerContext, team_id: String, mission_id: String) -> Result<(), String> {
    require_worker(ctx, "admin_fail_mission")?;

    let applied = run_command(
        ctx,
        "[MISSION]",
        &team_id,
        MissionCommand::Fail { mission_id: &mission_id, reason: FailReason::Aborted },
    )?;

    if applied.is_committed() {
        cancel_clock_checks(ctx, &team_id);
        log::info!("[MISSION] ✗ aborted team:{} mission:{}", team_id, mission_id);
    } else {
        log::info!("[MISSION] abort ignored team:{} mission:{} not active", team_id, mission_id);
    }
    Ok(())
}

// ==================== PRESENCE & FEED ====================

/// Store the caller's latest position. Out-of-date samples are dropped.
#[reducer]
pub fn report_location(ctx: &ReducerContext, lat: f64, lng: f64, captured_at: Option<Timestamp>) -> Result<(), String> {
    let (member, team_id) = get_member_team(ctx)?;

    let position = GeoPoint::new(lat, lng);
    if !position.is_valid() {
        return Err(format!("Invalid coordinates ({}, {})", lat, lng));
    }
    // Device clocks may run ahead; never accept a sample from the future
    let sample_at = match captured_at {
        Some(t) if t < ctx.timestamp => t,
        _ => ctx.timestamp,
    };

    let existing = ctx.db.member_location().user_id().find(&member.user_id);
    if !presence::is_newer_sample(existing.as_ref().map(|l| l.updated_at), sample_at) {
        log::debug!("[PRESENCE] stale sample user:{} ignored", short(&member.user_id));
        return Ok(());
    }

    let row = MemberLocation {
        user_id: member.user_id.clone(),
        team_id: team_id.clone(),
        display_name: member.display_name.clone(),
        avatar: member.avatar.clone(),
        position,
        updated_at: sample_at,
    };
    if existing.is_some() {
        ctx.db.member_location().user_id().update(row);
    } else {
        ctx.db.member_location().insert(row);
    }

    let Some(team) = ctx.db.team().id().find(&team_id) else {
        return Ok(());
    };
    let (Some(mission_id), Some(running)) = (&team.active_mission_id, &team.mission_progress) else {
        return Ok(());
    };
    let Ok(plan) = TableCatalog::new(ctx).plan(mission_id) else {
        return Ok(());
    };
    let route = presence::route(&plan);
    if let Some(g) = presence::guidance(Some(position), presence::next_target(&route, Some(running))) {
        log::debug!("[PRESENCE] user:{} team:{} target:{:?} distance_m:{:.0} bearing:{:.0}",
            short(&member.user_id), team_id, g.target.kind, g.distance_m, g.bearing_deg);
    }
    Ok(())
}

/// Append a game-master message to a team's feed
#[reducer]
pub fn post_team_notification(ctx: &ReducerContext, team_id: String, message: String) -> Result<(), String> {
    require_worker(ctx, "post_team_notification")?;

    if ctx.db.team().id().find(&team_id).is_none() {
        return Err(MissionError::not_found(RecordKind::Team, &team_id).to_string());
    }
    let message = normalize_message(&message, MAX_NOTIFICATION_LEN)
        .ok_or(format!("Message must be 1-{} characters", MAX_NOTIFICATION_LEN))?;

    let row = ctx.db.team_notification().insert(TeamNotification {
        id: 0, // auto_inc
        team_id: team_id.clone(),
        message,
        created_at: ctx.timestamp,
    });

    log::info!("[FEED] team:{} notification:{}", team_id, row.id);
    Ok(())
}

// ==================== INIT ====================

/// Initialize module
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner identity
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
        });
    }

    log::info!("Mission module initialized");
}
