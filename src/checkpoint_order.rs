// Checkpoint ordering
// Authors link checkpoints with next_checkpoint_id. That data is not validated on write,
// so the order is resolved once per load and never by following pointers during play.

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::Checkpoint;

/// Integrity fault found while resolving a checkpoint chain.
/// Never fatal: the resolved order falls back to id order for anything unreachable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphAnomaly {
    #[error("cycle detected at checkpoint {at}")]
    CycleDetected { at: String },

    #[error("ambiguous chain: multiple heads {heads:?}")]
    MultipleHeads { heads: Vec<String> },

    #[error("ambiguous chain: {from} links to unknown checkpoint {to}")]
    DanglingLink { from: String, to: String },

    #[error("ambiguous chain: checkpoint {0} declared more than once")]
    DuplicateId(String),

    #[error("checkpoints {0:?} unreachable from head, appended in id order")]
    Unreached(Vec<String>),
}

impl GraphAnomaly {
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::CycleDetected { .. })
    }
}

/// Total, duplicate-free traversal order for one mission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOrder {
    ids: Vec<String>,
    anomalies: Vec<GraphAnomaly>,
}

impl ResolvedOrder {
    /// Resolve from `(id, next_id)` links.
    ///
    /// The head is the only id nobody links to. The walk follows next pointers until a
    /// missing link or an already-visited id. Whatever the walk misses is appended in id order.
    pub fn resolve<'a, I>(links: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let mut anomalies = Vec::new();

        // BTreeMap keeps every fallback deterministic (id order)
        let mut next_of: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        for (id, next) in links {
            if next_of.contains_key(id) {
                anomalies.push(GraphAnomaly::DuplicateId(id.to_string()));
                continue;
            }
            next_of.insert(id, next);
        }

        if next_of.is_empty() {
            return Self { ids: Vec::new(), anomalies };
        }

        let mut referenced: BTreeSet<&str> = BTreeSet::new();
        for (&from, next) in &next_of {
            if let Some(to) = *next {
                if next_of.contains_key(to) {
                    referenced.insert(to);
                } else {
                    anomalies.push(GraphAnomaly::DanglingLink {
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
            }
        }

        let heads: Vec<&str> = next_of
            .keys()
            .copied()
            .filter(|id| !referenced.contains(id))
            .collect();

        if heads.len() > 1 {
            anomalies.push(GraphAnomaly::MultipleHeads {
                heads: heads.iter().map(|h| h.to_string()).collect(),
            });
        }

        let mut ids: Vec<String> = Vec::with_capacity(next_of.len());
        let mut visited: BTreeSet<&str> = BTreeSet::new();

        match heads.first() {
            Some(&head) => {
                let mut cursor = Some(head);
                while let Some(id) = cursor {
                    if !visited.insert(id) {
                        anomalies.push(GraphAnomaly::CycleDetected { at: id.to_string() });
                        break;
                    }
                    ids.push(id.to_string());
                    cursor = next_of
                        .get(id)
                        .copied()
                        .flatten()
                        .filter(|next| next_of.contains_key(next));
                }
            }
            // Every checkpoint is somebody's next: the whole set is cyclic
            None => {
                if let Some(&first) = next_of.keys().next() {
                    anomalies.push(GraphAnomaly::CycleDetected { at: first.to_string() });
                }
            }
        }

        let unreached: Vec<String> = next_of
            .keys()
            .filter(|id| !visited.contains(*id))
            .map(|id| id.to_string())
            .collect();
        if !unreached.is_empty() {
            ids.extend(unreached.iter().cloned());
            anomalies.push(GraphAnomaly::Unreached(unreached));
        }

        Self { ids, anomalies }
    }

    pub fn from_checkpoints(checkpoints: &[Checkpoint]) -> Self {
        Self::resolve(
            checkpoints
                .iter()
                .map(|cp| (cp.id.as_str(), cp.next_checkpoint_id.as_deref())),
        )
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn anomalies(&self) -> &[GraphAnomaly] {
        &self.anomalies
    }

    pub fn head(&self) -> Option<&str> {
        self.ids.first().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|c| c == id)
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|c| c == id)
    }

    /// First checkpoint in order that is not in `completed`
    pub fn first_pending(&self, completed: &[String]) -> Option<&str> {
        self.ids
            .iter()
            .find(|id| !completed.contains(id))
            .map(String::as_str)
    }

    /// Count of checkpoints in order not yet in `completed`
    pub fn pending_count(&self, completed: &[String]) -> usize {
        self.ids.iter().filter(|id| !completed.contains(id)).count()
    }
}
