pub mod list;
pub mod receive;
pub mod send;
pub mod version;

use chrono::{DateTime, Utc};

/// How `send` picks its from/to pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendMode {
    /// Full backup of one snapshot.
    Full { source: String },
    /// Manual incremental: explicit base, explicit target.
    Manual { from: String, to: String },
    /// Planner-driven: reconcile destination manifests with source
    /// snapshots. `fallback_full` is `--auto`.
    Smart { dataset: String, fallback_full: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send {
        mode: SendMode,
        destinations: Vec<String>,
    },
    Receive {
        source: String,
        auto: bool,
        incremental: bool,
        force: bool,
        props: Vec<String>,
        destinations: Vec<String>,
        target: String,
    },
    List {
        destinations: Vec<String>,
        volume_glob: Option<String>,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        json: bool,
    },
    Version {
        json: bool,
    },
}
