//! Core module - the host-independent highlight pipeline

pub mod animation;
pub mod cell;
pub mod color;
pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod group_cache;
pub mod hooks;
pub mod options;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod types;
pub mod world;

pub use color::HighlightColor;
pub use config::HighlightConfig;
pub use error::{AdapterError, ConfigError, HighlightError};
pub use hooks::{HighlightChange, HighlightHook, Verdict};
pub use options::{HighlightOptions, RulePolicy};
pub use protocol::{Message, ProtocolAdapter, QueueAdapter};
pub use scheduler::{StepScheduler, TaskHandle, TickScheduler};
pub use service::{HighlightService, HighlightStats};
pub use types::{CellPos, IdAllocator, RegionPos, TargetId, ViewerId, WorldId, WorldPos};
pub use world::WorldView;
