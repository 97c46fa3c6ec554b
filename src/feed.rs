// Team notification feed
// Append-only, ordered by (created_at, id). Clients render it from whatever rows the
// subscription last delivered, so everything here is a function of the row set alone.

use crate::TeamNotification;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationFeed {
    entries: Vec<TeamNotification>,
}

impl NotificationFeed {
    pub fn from_rows<I: IntoIterator<Item = TeamNotification>>(rows: I) -> Self {
        let mut entries: Vec<TeamNotification> = rows.into_iter().collect();
        entries.sort_by_key(|n| (n.created_at, n.id));
        entries.dedup_by_key(|n| n.id);
        Self { entries }
    }

    /// Oldest first
    pub fn entries(&self) -> &[TeamNotification] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&TeamNotification> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trimmed message, or None if nothing is left or it is too long
pub fn normalize_message(message: &str, max_len: usize) -> Option<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() || trimmed.chars().count() > max_len {
        return None;
    }
    Some(trimmed.to_string())
}
