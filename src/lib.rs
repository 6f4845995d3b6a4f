//! Featmat core crate.
//!
//! Builds per-episode feature matrices from clinical event stores:
//! - episode index keyed by (patient, index time)
//! - windowed summaries of lab results and flowsheet values
//! - pre/post day-bin counts of clinical items
//! - TSV matrix output with one row per input episode

mod cache;
mod config;
mod day_bins;
mod episodes;
mod events;
mod factory;
mod matrix;
mod memory_source;
mod observability;
mod plan;
mod sqlite_source;
mod time_cycle;
mod timestamps;
mod window;

pub use cache::{CacheKey, EventCache};
pub use config::{build_config_from_env, parse_day_bins, BuildConfig};
pub use day_bins::{
    count_day_bins, item_label, DayBinCounter, DayBinSummary, FeatureSide, SideCounts,
    DEFAULT_DAY_BINS,
};
pub use episodes::{
    read_episodes_tsv, Episode, EpisodeColumns, EpisodeIndex, EpisodeRecord,
};
pub use events::{
    fetch_event_stream, parse_event_value, DataSourceError, Event, EventSelector, EventSource,
    EventStream, ItemColumn, PatientEvents, RawEvent, SanitizeReport, ValueConversionError,
    DEFAULT_SENTINEL_RESULT_VALUE,
};
pub use factory::{FeatureMatrixFactory, DEFAULT_RACE_FEATURES, SEX_FEATURES};
pub use matrix::{
    FeatureColumn, FeatureDType, FeatureMatrix, FeatureValue, MatrixError, MatrixRow, NULL_TEXT,
};
pub use memory_source::{
    like_match, CatalogItem, FlowsheetRow, LabResultRow, MemoryEventSource, PatientItemRow,
};
pub use observability::{
    init_logging, log_build_start, log_inputs_selected, log_matrix_written,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use plan::{
    load_item_groups_tsv, FeaturePlan, FeatureStep, ItemGroup, ItemGroups, PlanError,
    WindowSpec, WindowUnit,
};
pub use sqlite_source::SqliteEventSource;
pub use time_cycle::{apply_time_cycle, cycle_encoding, time_cycle_columns, TimeAttribute};
pub use timestamps::{days_between, format_timestamp, parse_timestamp, SECONDS_PER_DAY};
pub use window::{
    summarize, window_column_names, Window, WindowSummary, WindowedAggregator, WINDOW_SUFFIXES,
};
