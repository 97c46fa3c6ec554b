// Team roster
// Members live inside the team record, so joins, leaves and online status go through the same
// CAS loop as mission progress.

use spacetimedb::SpacetimeType;

use crate::error::{MissionError, RecordKind};
use crate::resolver::Transition;
use crate::Team;

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Leader,
    Member,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Online,
    Offline,
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct TeamMember {
    pub user_id: String,
    pub role: MemberRole,
    pub status: MemberStatus,
}

impl TeamMember {
    pub fn new(user_id: &str, role: MemberRole) -> Self {
        Self {
            user_id: user_id.to_string(),
            role,
            status: MemberStatus::Online,
        }
    }
}

pub fn find_member<'t>(team: &'t Team, user_id: &str) -> Option<&'t TeamMember> {
    team.members.iter().find(|m| m.user_id == user_id)
}

pub fn online_count(team: &Team) -> usize {
    team.members
        .iter()
        .filter(|m| m.status == MemberStatus::Online)
        .count()
}

/// Add `user_id` as a Member. Re-joining the same team is a no-op.
pub fn join(team: &Team, user_id: &str, capacity: usize) -> Result<Transition, MissionError> {
    if find_member(team, user_id).is_some() {
        return Ok(Transition::Unchanged);
    }
    if team.members.len() >= capacity {
        return Err(MissionError::TeamFull {
            team_id: team.id.clone(),
            capacity,
        });
    }

    let mut next = team.clone();
    // A team emptied by leaves gets its next joiner as leader
    let role = if next.members.is_empty() {
        MemberRole::Leader
    } else {
        MemberRole::Member
    };
    next.members.push(TeamMember::new(user_id, role));
    Ok(Transition::Updated(next))
}

/// Remove `user_id`. Only while the team is Idle; a departing leader hands over to the
/// longest-standing member.
pub fn leave(team: &Team, user_id: &str) -> Result<Transition, MissionError> {
    if let Some(mission_id) = &team.active_mission_id {
        return Err(MissionError::MissionInProgress {
            team_id: team.id.clone(),
            mission_id: mission_id.clone(),
        });
    }
    let index = team
        .members
        .iter()
        .position(|m| m.user_id == user_id)
        .ok_or_else(|| MissionError::not_found(RecordKind::Member, user_id))?;

    let mut next = team.clone();
    let departed = next.members.remove(index);
    if departed.role == MemberRole::Leader {
        if let Some(successor) = next.members.first_mut() {
            successor.role = MemberRole::Leader;
        }
    }
    Ok(Transition::Updated(next))
}

/// Mark a member Online/Offline; unknown members and unchanged status write nothing
pub fn set_status(team: &Team, user_id: &str, status: MemberStatus) -> Transition {
    match find_member(team, user_id) {
        Some(member) if member.status != status => {
            let mut next = team.clone();
            for m in next.members.iter_mut().filter(|m| m.user_id == user_id) {
                m.status = status;
            }
            Transition::Updated(next)
        }
        _ => Transition::Unchanged,
    }
}
