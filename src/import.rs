// Mission authoring import
// Accepts a JSON array of missions with nested checkpoints, exported from the authoring tool
// (camelCase keys). Each mission replaces any stored mission with the same id.

use std::collections::HashSet;

use serde_json::Value;
use spacetimedb::{log, reducer, ReducerContext, Table};

use crate::checkpoint_order::ResolvedOrder;
use crate::presence::GeoPoint;
use crate::{checkpoint, mission, require_worker};
use crate::{ChallengeType, Checkpoint, Mission, PasswordDigit};

/// One mission as it will be stored
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedMission {
    pub mission: Mission,
    pub checkpoints: Vec<Checkpoint>,
}

impl ImportedMission {
    pub fn order(&self) -> ResolvedOrder {
        ResolvedOrder::from_checkpoints(&self.checkpoints)
    }
}

/// Parse {"lat": .., "lng": ..}; absent or null means no location
fn parse_location(val: Option<&Value>, what: &str) -> Result<Option<GeoPoint>, String> {
    let Some(val) = val.filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let lat = val.get("lat").and_then(|v| v.as_f64()).ok_or(format!("{}: missing lat", what))?;
    let lng = val.get("lng").and_then(|v| v.as_f64()).ok_or(format!("{}: missing lng", what))?;
    let point = GeoPoint::new(lat, lng);
    if !point.is_valid() {
        return Err(format!("{}: coordinates out of range ({}, {})", what, lat, lng));
    }
    Ok(Some(point))
}

fn parse_challenge_type(raw: &str) -> Option<ChallengeType> {
    match raw.to_ascii_lowercase().as_str() {
        "physical" => Some(ChallengeType::Physical),
        "puzzle" => Some(ChallengeType::Puzzle),
        "photo" => Some(ChallengeType::Photo),
        "quiz" => Some(ChallengeType::Quiz),
        _ => None,
    }
}

/// Digit value may be authored as a string or a bare number
fn parse_password_digit(val: Option<&Value>, what: &str) -> Result<Option<PasswordDigit>, String> {
    let Some(val) = val.filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let position = val
        .get("position")
        .and_then(|v| v.as_i64())
        .and_then(|p| i32::try_from(p).ok())
        .ok_or(format!("{}: missing passwordDigit.position", what))?;
    let value = match val.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(format!("{}: missing passwordDigit.value", what)),
    };
    Ok(Some(PasswordDigit { position, value }))
}

fn parse_checkpoint(c: &Value, mission_id: &str, i: usize) -> Result<Checkpoint, String> {
    let what = format!("Mission {} checkpoint {}", mission_id, i);
    let raw_type = c.get("challengeType").and_then(|v| v.as_str()).ok_or(format!("{}: missing challengeType", what))?;

    Ok(Checkpoint {
        id: c.get("id").and_then(|v| v.as_str()).ok_or(format!("{}: missing id", what))?.to_string(),
        mission_id: mission_id.to_string(),
        name: c.get("name").and_then(|v| v.as_str()).ok_or(format!("{}: missing name", what))?.to_string(),
        challenge_type: parse_challenge_type(raw_type).ok_or(format!("{}: unknown challengeType {}", what, raw_type))?,
        // Opaque to the engine; stored verbatim for the challenge UI
        challenge: c.get("challenge").map(|v| v.to_string()).unwrap_or_else(|| "{}".to_string()),
        password_digit: parse_password_digit(c.get("passwordDigit"), &what)?,
        next_checkpoint_id: c.get("nextCheckpointId").and_then(|v| v.as_str()).map(|s| s.to_string()),
        location: parse_location(c.get("location"), &what)?,
    })
}

pub fn parse_mission(m: &Value, i: usize) -> Result<ImportedMission, String> {
    let id = m.get("id").and_then(|v| v.as_str()).ok_or(format!("Mission {}: missing id", i))?.to_string();
    let minutes = m
        .get("estimatedDurationMinutes")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(format!("Mission {}: missing estimatedDurationMinutes", i))?;
    if minutes == 0 {
        return Err(format!("Mission {}: estimatedDurationMinutes must be positive", i));
    }

    let mission = Mission {
        title: m.get("title").and_then(|v| v.as_str()).ok_or(format!("Mission {}: missing title", i))?.to_string(),
        estimated_duration_minutes: minutes,
        password: m.get("password").and_then(|v| v.as_str()).ok_or(format!("Mission {}: missing password", i))?.to_string(),
        start_location: parse_location(m.get("startLocation"), &format!("Mission {} start", i))?,
        end_location: parse_location(m.get("endLocation"), &format!("Mission {} end", i))?,
        active: m.get("active").and_then(|v| v.as_bool()).unwrap_or(true),
        id,
    };

    let checkpoints = m
        .get("checkpoints")
        .and_then(|v| v.as_array())
        .ok_or(format!("Mission {}: missing or invalid checkpoints", i))?
        .iter()
        .enumerate()
        .map(|(j, c)| parse_checkpoint(c, &mission.id, j))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ImportedMission { mission, checkpoints })
}

pub fn parse_missions(json_data: &str) -> Result<Vec<ImportedMission>, String> {
    let data: Value = serde_json::from_str(json_data).map_err(|e| format!("Invalid JSON: {}", e))?;
    data.as_array()
        .ok_or("Expected JSON array of missions")?
        .iter()
        .enumerate()
        .map(|(i, m)| parse_mission(m, i))
        .collect()
}

fn replace_mission(ctx: &ReducerContext, imported: &ImportedMission) -> Result<usize, String> {
    let mission_id = &imported.mission.id;

    let stale: Vec<String> = ctx.db.checkpoint().mission_id().filter(mission_id).map(|cp| cp.id).collect();
    for id in stale {
        ctx.db.checkpoint().id().delete(&id);
    }
    if ctx.db.mission().id().find(mission_id).is_some() {
        ctx.db.mission().id().delete(mission_id);
    }
    ctx.db.mission().insert(imported.mission.clone());

    let mut seen = HashSet::new();
    for cp in &imported.checkpoints {
        // Duplicates are reported by the graph resolver; first declaration wins
        if !seen.insert(cp.id.clone()) {
            continue;
        }
        if let Some(existing) = ctx.db.checkpoint().id().find(&cp.id) {
            return Err(format!(
                "Checkpoint {} already belongs to mission {}",
                cp.id, existing.mission_id
            ));
        }
        ctx.db.checkpoint().insert(cp.clone());
    }
    Ok(seen.len())
}

/// Import missions from JSON. All-or-nothing: any parse error rejects the whole batch.
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_import_missions(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    require_worker(ctx, "bulk_import_missions")?;

    let missions = parse_missions(&json_data)?;

    let mut checkpoint_count = 0;
    for imported in &missions {
        checkpoint_count += replace_mission(ctx, imported)?;

        let order = imported.order();
        if order.is_empty() {
            log::warn!("[IMPORT] mission:{} has no checkpoints and cannot be started", imported.mission.id);
        }
        for anomaly in order.anomalies() {
            log::warn!("[IMPORT] mission:{} {}", imported.mission.id, anomaly);
        }
    }

    log::info!("[IMPORT] ✓ {} missions, {} checkpoints", missions.len(), checkpoint_count);
    Ok(())
}
