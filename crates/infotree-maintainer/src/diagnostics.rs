//! Operational snapshot of a running store.

use serde::Serialize;

use infotree_state::WatcherInfo;

/// Counters and scheduling state, serializable for operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// Updates accepted but not yet applied, including watcher follow-ups.
    pub pending_updates: u64,
    pub processed_updates: u64,
    pub sweeps_run: u64,
    pub watchers: usize,
    pub enabled_watchers: usize,
    pub watcher_triggers: Vec<WatcherInfo>,
    /// Delay until the next expiry sweep; `None` when nothing can expire.
    pub next_sweep_in_ms: Option<u64>,
    pub shut_down: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_json() {
        let diag = Diagnostics {
            pending_updates: 2,
            processed_updates: 10,
            sweeps_run: 1,
            watchers: 1,
            enabled_watchers: 0,
            watcher_triggers: vec![WatcherInfo {
                name: "loads".to_string(),
                enabled: false,
                triggers: 3,
            }],
            next_sweep_in_ms: None,
            shut_down: false,
        };

        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["pending_updates"], 2);
        assert_eq!(json["watcher_triggers"][0]["name"], "loads");
        assert_eq!(json["watcher_triggers"][0]["triggers"], 3);
        assert!(json["next_sweep_in_ms"].is_null());
    }
}
