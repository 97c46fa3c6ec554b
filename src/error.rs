// Engine error taxonomy
// Reducers surface these to clients as strings; disposition() decides how loud to log

use std::fmt;
use thiserror::Error;

/// Kind of record a lookup failed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Team,
    Mission,
    Checkpoint,
    Member,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Team => write!(f, "team"),
            Self::Mission => write!(f, "mission"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Member => write!(f, "member"),
        }
    }
}

/// How a client should react to a rejected operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient or player-correctable, same request may be sent again
    Retry,
    /// Client view is stale, re-read the latest team snapshot
    Resync,
    /// Request is invalid for the current state
    Rejected,
    /// Authoring problem outside player control
    DataError,
}

/// Errors produced by mission operations. Every variant means nothing was committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MissionError {
    #[error("team {team_id} already has mission {mission_id} active")]
    AlreadyActive { team_id: String, mission_id: String },

    #[error("team {team_id} cannot change its roster while mission {mission_id} is in progress")]
    MissionInProgress { team_id: String, mission_id: String },

    #[error("team {0} has no active mission")]
    NoActiveMission(String),

    #[error("checkpoint {requested} is out of order (current: {})", .current.as_deref().unwrap_or("none"))]
    OutOfOrder {
        requested: String,
        current: Option<String>,
    },

    #[error("incorrect password")]
    IncorrectPassword,

    #[error("{remaining} checkpoint(s) still to complete")]
    CheckpointsRemaining { remaining: usize },

    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    #[error("mission {0} has no checkpoints")]
    EmptyMission(String),

    #[error("mission {0} is not open for play")]
    MissionInactive(String),

    #[error("team {team_id} is full ({capacity} members)")]
    TeamFull { team_id: String, capacity: usize },

    #[error("team {team_id} update still conflicting after {attempts} attempts")]
    ConcurrencyConflict { team_id: String, attempts: u32 },
}

impl MissionError {
    pub fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Self::IncorrectPassword | Self::ConcurrencyConflict { .. } => Disposition::Retry,
            Self::OutOfOrder { .. } => Disposition::Resync,
            Self::NotFound { .. } | Self::EmptyMission(_) => Disposition::DataError,
            Self::AlreadyActive { .. }
            | Self::MissionInProgress { .. }
            | Self::NoActiveMission(_)
            | Self::CheckpointsRemaining { .. }
            | Self::MissionInactive(_)
            | Self::TeamFull { .. } => Disposition::Rejected,
        }
    }
}

/// Log a rejected operation at a level matching its disposition
pub fn log_rejection(tag: &str, team_id: &str, err: &MissionError) {
    match err.disposition() {
        Disposition::DataError => {
            log::error!("{} ✗ team:{} data error, contact administrator: {}", tag, team_id, err)
        }
        Disposition::Retry | Disposition::Resync => {
            log::warn!("{} ✗ team:{} {}", tag, team_id, err)
        }
        Disposition::Rejected => log::info!("{} rejected team:{} {}", tag, team_id, err),
    }
}
