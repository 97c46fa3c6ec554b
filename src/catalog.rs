// Mission reference data
// Missions and checkpoints are read-only during play; a plan bundles a mission with its
// resolved checkpoint order for the duration of one operation.

use std::collections::BTreeMap;

use spacetimedb::ReducerContext;

use crate::checkpoint_order::ResolvedOrder;
use crate::error::{MissionError, RecordKind};
use crate::{checkpoint, mission, Checkpoint, Mission};

/// Read access to authored missions
pub trait MissionCatalog {
    fn mission(&self, mission_id: &str) -> Result<Mission, MissionError>;

    fn checkpoints(&self, mission_id: &str) -> Vec<Checkpoint>;

    fn plan(&self, mission_id: &str) -> Result<MissionPlan, MissionError> {
        let mission = self.mission(mission_id)?;
        let checkpoints = self.checkpoints(mission_id);
        Ok(MissionPlan::new(mission, checkpoints))
    }
}

/// A mission with its checkpoints resolved into traversal order
#[derive(Debug, Clone)]
pub struct MissionPlan {
    pub mission: Mission,
    order: ResolvedOrder,
    checkpoints: BTreeMap<String, Checkpoint>,
}

impl MissionPlan {
    pub fn new(mission: Mission, checkpoints: Vec<Checkpoint>) -> Self {
        let order = ResolvedOrder::from_checkpoints(&checkpoints);
        let mut by_id = BTreeMap::new();
        for cp in checkpoints {
            // First declaration wins, same as the resolver
            by_id.entry(cp.id.clone()).or_insert(cp);
        }
        Self {
            mission,
            order,
            checkpoints: by_id,
        }
    }

    pub fn order(&self) -> &ResolvedOrder {
        &self.order
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(checkpoint_id)
    }

    /// Checkpoints in resolved order
    pub fn ordered_checkpoints(&self) -> impl Iterator<Item = &Checkpoint> + '_ {
        self.order
            .ids()
            .iter()
            .filter_map(move |id| self.checkpoints.get(id))
    }

    /// Declared digit position. A checkpoint without one sorts after every declared
    /// position, offset by its resolved index.
    pub fn digit_position(&self, checkpoint_id: &str) -> i32 {
        if let Some(digit) = self.checkpoint(checkpoint_id).and_then(|cp| cp.password_digit.as_ref()) {
            return digit.position;
        }
        let Some(index) = self.order.position_of(checkpoint_id) else {
            return i32::MAX;
        };
        let first_free = self
            .checkpoints
            .values()
            .filter_map(|cp| cp.password_digit.as_ref())
            .map(|digit| digit.position.saturating_add(1))
            .max()
            .unwrap_or(0);
        i32::try_from(index).map_or(i32::MAX, |i| first_free.saturating_add(i))
    }

    /// Digit value the author attached to a checkpoint
    pub fn declared_digit(&self, checkpoint_id: &str) -> Option<&str> {
        self.checkpoint(checkpoint_id)
            .and_then(|cp| cp.password_digit.as_ref())
            .map(|digit| digit.value.as_str())
    }
}

/// Catalog over the module tables
pub struct TableCatalog<'a> {
    ctx: &'a ReducerContext,
}

impl<'a> TableCatalog<'a> {
    pub fn new(ctx: &'a ReducerContext) -> Self {
        Self { ctx }
    }
}

impl MissionCatalog for TableCatalog<'_> {
    fn mission(&self, mission_id: &str) -> Result<Mission, MissionError> {
        self.ctx
            .db
            .mission()
            .id()
            .find(&mission_id.to_string())
            .ok_or_else(|| MissionError::not_found(RecordKind::Mission, mission_id))
    }

    fn checkpoints(&self, mission_id: &str) -> Vec<Checkpoint> {
        self.ctx
            .db
            .checkpoint()
            .mission_id()
            .filter(&mission_id.to_string())
            .collect()
    }
}
