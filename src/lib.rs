//! Entity lag feature augmentation.
//!
//! Every event is extended with `past_{attribute}_{rank}` columns drawn from
//! the same entity's most recent prior events:
//! - `history`: per-entity chronological index with binary-search lookups
//! - `projector`: copy / equality-flag projection and batch run drivers
//! - `table_io`: CSV adapter used by the `lag_augment` binary

mod config;
mod event;
mod history;
mod observability;
mod projector;
mod table_io;

pub use config::{
    load_run_config, ConfigLoadError, LagConfig, LagConfigError, RunConfig, TransformRule,
    ValidatedLagConfig, DEFAULT_LOOKBACK_COUNT, LAG_SCHEMA_VERSION,
};
pub use event::{
    observed_attributes, parse_events, parse_timestamp, AttrValue, Attributes, Event,
    EventOrigin, MalformedEventError, RawEvent, TimestampError,
};
pub use history::{partition_of, EntityHistoryIndex};
pub use observability::{
    init_logging, log_app_start, log_mode_selected, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use projector::{
    assert_schema_compatible, augment_against_history, augment_events, augment_partitioned,
    build_lag_schema, project, project_batch, AugmentationReport, AugmentationRun,
    AugmentedEvent, LagColumn, LagKey, LagSchema,
};
pub use table_io::{
    read_event_table, read_event_table_from, write_augmented_table, write_augmented_table_to,
    EventTable, TableIoError, TableLayout,
};
