//! Core module - indexing engine, cache, merge and selection

pub mod cache;
pub mod config;
pub mod engine;
pub mod merge;
pub mod project;
pub mod propagation;
pub mod record;
pub mod remote;
pub mod selection;
pub mod source;
pub mod working_set;

pub use cache::{CacheStats, CacheStore, KeyValueStorage, MemoryStorage, SqliteStorage, StorageError};
pub use config::Config;
pub use engine::{
    ApplyOutcome, IndexError, IndexOutcome, LiveSource, Phase, RealtimeStatus, ReferenceKind,
    SourceEngine, SourceState,
};
pub use merge::{merge, ExclusionConfig, ExclusionSet, MergeMemo, MergedRecord, SortSpec, SourceView};
pub use project::{Project, ProjectError};
pub use propagation::{PropagationEngine, PropagationReport, ReferenceTable, ReferenceWatch};
pub use record::{EntityRef, FieldValue, IndexedRecord, RecordKey, SourceSnapshot};
pub use remote::{ChangeFeed, ChangeNotification, MemoryBackend, RemoteError, RemoteStore, SessionGate};
pub use selection::{SelectionConflict, SelectionSet};
pub use source::{InclusionRule, SourceConfig};
pub use working_set::WorkingSet;
