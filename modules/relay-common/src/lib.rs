pub mod config;
pub mod error;
pub mod persist;
pub mod types;

pub use config::{
    load_sources, load_targets, save_targets, Config, EngineSettings, RenderBackend,
    SelectionStrategy,
};
pub use error::{RelayError, Result};
pub use types::{
    add_saturating, to_chrono, CandidateItem, ExecutionKind, ItemBatch, NewItem, SourceSpec, Target,
    DEFAULT_CLASS,
};
