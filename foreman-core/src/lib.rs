//! Foreman core library — domain types, settings, errors.
//!
//! Public API surface:
//! - [`types`] — newtypes, records, descriptors
//! - [`settings`] — recognized configuration options
//! - [`error`] — [`SettingsError`]

pub mod error;
pub mod settings;
pub mod types;

pub use error::SettingsError;
pub use settings::{
    default_root, BackpressureMode, LogSettings, PoolSettings, Selection, Settings, StoreSettings,
    WorkerSettings,
};
pub use types::{
    ConfigKey, ConfigSnapshot, ConfigValue, ConfigVersion, EntryPoint, Level, LogRecord, Task,
    TaskId, WorkerDescriptor, WorkerId, WorkerState,
};
