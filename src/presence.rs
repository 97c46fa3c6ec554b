// Team presence
// Pure geometry over member location samples. Independent of mission state except for
// picking the next waypoint; a member with no sample is simply "unknown".

use std::collections::HashMap;

use spacetimedb::{SpacetimeType, Timestamp};

use crate::catalog::MissionPlan;
use crate::progress::MissionProgress;
use crate::Team;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Great-circle distance (haversine)
pub fn distance_meters(from: GeoPoint, to: GeoPoint) -> f64 {
    let (lat1, lat2) = (from.lat.to_radians(), to.lat.to_radians());
    let d_lat = lat2 - lat1;
    let d_lng = (to.lng - from.lng).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial bearing in degrees, normalized to [0, 360)
pub fn bearing_degrees(from: GeoPoint, to: GeoPoint) -> f64 {
    let (lat1, lat2) = (from.lat.to_radians(), to.lat.to_radians());
    let d_lng = (to.lng - from.lng).to_radians();

    let y = d_lng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lng.cos();
    let bearing = y.atan2(x).to_degrees().rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negatives
    if bearing >= 360.0 {
        0.0
    } else {
        bearing
    }
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum WaypointKind {
    Start,
    Checkpoint(String),
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub kind: WaypointKind,
    pub at: GeoPoint,
}

/// [start, ...located checkpoints in resolved order, end]
pub fn route(plan: &MissionPlan) -> Vec<Waypoint> {
    let mut waypoints = Vec::new();
    if let Some(at) = plan.mission.start_location {
        waypoints.push(Waypoint { kind: WaypointKind::Start, at });
    }
    for cp in plan.ordered_checkpoints() {
        if let Some(at) = cp.location {
            waypoints.push(Waypoint {
                kind: WaypointKind::Checkpoint(cp.id.clone()),
                at,
            });
        }
    }
    if let Some(at) = plan.mission.end_location {
        waypoints.push(Waypoint { kind: WaypointKind::End, at });
    }
    waypoints
}

/// First waypoint not yet reached.
///
/// Without progress the team is still heading to the start. Once started, the start counts as
/// reached, checkpoints are reached when completed, and the end stays the target until the
/// mission is unlocked.
pub fn next_target<'r>(route: &'r [Waypoint], progress: Option<&MissionProgress>) -> Option<&'r Waypoint> {
    route.iter().find(|wp| match (&wp.kind, progress) {
        (WaypointKind::Start, progress) => progress.is_none(),
        (WaypointKind::Checkpoint(_), None) => true,
        (WaypointKind::Checkpoint(id), Some(p)) => !p.is_completed(id),
        (WaypointKind::End, _) => true,
    })
}

/// Distance and heading from a member to its next target
#[derive(Debug, Clone, PartialEq)]
pub struct Guidance {
    pub target: Waypoint,
    pub distance_m: f64,
    pub bearing_deg: f64,
}

/// None while either the member's location or the target is unknown
pub fn guidance(position: Option<GeoPoint>, target: Option<&Waypoint>) -> Option<Guidance> {
    let (position, target) = (position?, target?);
    Some(Guidance {
        target: target.clone(),
        distance_m: distance_meters(position, target.at),
        bearing_deg: bearing_degrees(position, target.at),
    })
}

/// Guidance row for one team member; every field but `user_id` is None while unknown
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct MemberGuidance {
    pub user_id: String,
    pub target: Option<WaypointKind>,
    pub distance_m: Option<f64>,
    pub bearing_deg: Option<f64>,
}

/// Guidance for every member of `team`, in roster order.
///
/// `plan` is the team's active mission; without one there is no target. `positions` holds the
/// latest sample per user id.
pub fn team_guidance(
    team: &Team,
    plan: Option<&MissionPlan>,
    positions: &HashMap<String, GeoPoint>,
) -> Vec<MemberGuidance> {
    let waypoints = plan.map(route).unwrap_or_default();
    let target = match team.mission_progress.as_ref() {
        Some(progress) if plan.is_some() => next_target(&waypoints, Some(progress)),
        _ => None,
    };

    team.members
        .iter()
        .map(|member| {
            let position = positions.get(&member.user_id).copied();
            match guidance(position, target) {
                Some(g) => MemberGuidance {
                    user_id: member.user_id.clone(),
                    target: Some(g.target.kind),
                    distance_m: Some(g.distance_m),
                    bearing_deg: Some(g.bearing_deg),
                },
                None => MemberGuidance {
                    user_id: member.user_id.clone(),
                    target: target.map(|wp| wp.kind.clone()),
                    distance_m: None,
                    bearing_deg: None,
                },
            }
        })
        .collect()
}

/// Samples arrive from many devices at unknown rates; only move forward in time
pub fn is_newer_sample(stored_at: Option<Timestamp>, sample_at: Timestamp) -> bool {
    stored_at.map_or(true, |stored| sample_at > stored)
}
