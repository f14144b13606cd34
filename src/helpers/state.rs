use chrono::{DateTime, Utc};
use serde::Serialize;

/// in-memory operational snapshot exposed on /state
#[derive(Clone, Serialize)]
pub struct State {
    pub last_event: DateTime<Utc>,
    pub last_reconcile: Option<DateTime<Utc>>,
}

impl State {
    pub fn new() -> Self {
        State {
            last_event: Utc::now(),
            last_reconcile: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_event = Utc::now();
    }

    pub fn mark_reconcile(&mut self) {
        self.last_event = Utc::now();
        self.last_reconcile = Some(self.last_event);
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
