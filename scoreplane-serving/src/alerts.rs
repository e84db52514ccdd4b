//! Alert severity and the capped in-memory ring alerts are appended to.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of alerts retained per ring.
pub const DEFAULT_ALERT_CAPACITY: usize = 1_000;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn is_alert(self) -> bool {
        self != Self::None
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only ring of immutable alert records.
///
/// Entries are never mutated after they are pushed; once `capacity` is
/// reached the oldest alert is dropped.
#[derive(Debug)]
pub struct AlertRing<A> {
    entries: Mutex<VecDeque<A>>,
    capacity: usize,
}

impl<A: Clone> AlertRing<A> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, alert: A) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(alert);
    }

    pub fn extend(&self, alerts: impl IntoIterator<Item = A>) {
        for alert in alerts {
            self.push(alert);
        }
    }

    /// The most recent `n` alerts, oldest first.
    pub fn recent(&self, n: usize) -> Vec<A> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn all(&self) -> Vec<A> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<A: Clone> Default for AlertRing<A> {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}
