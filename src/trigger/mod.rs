pub mod poller;
pub mod state;

pub use poller::{ChangedFile, FilePoller, TriggerEvent, WatchConfig};
pub use state::{
    decide, default_state_key, evict_expired, fingerprint, ChangeDecision, ChangeOn, ChangeType,
    JsonStateStore, MemoryStateStore, SqliteStateStore, StateStore, VersionEntry,
};
