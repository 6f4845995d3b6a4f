//! Windowed summary statistics of result events around each episode's index
//! time.

use chrono::{NaiveDateTime, TimeDelta};
use tracing::info;

use crate::episodes::EpisodeIndex;
use crate::events::{Event, EventStream};
use crate::matrix::{FeatureColumn, FeatureDType, FeatureValue, MatrixError};
use crate::timestamps::days_between;

pub const WINDOW_SUFFIXES: [&str; 15] = [
    "count",
    "countInRange",
    "min",
    "max",
    "median",
    "mean",
    "std",
    "first",
    "last",
    "diff",
    "slope",
    "proximate",
    "firstTimeDays",
    "lastTimeDays",
    "proximateTimeDays",
];

const SECONDS_PER_DAY: i64 = 86_400;

/// `[index_time + pre, index_time + post)`; a `None` bound leaves that side
/// open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub pre: Option<TimeDelta>,
    pub post: Option<TimeDelta>,
}

impl Window {
    pub fn new(pre: Option<TimeDelta>, post: Option<TimeDelta>) -> Self {
        Self { pre, post }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn days(pre_days: i64, post_days: i64) -> Self {
        Self {
            pre: Some(TimeDelta::days(pre_days)),
            post: Some(TimeDelta::days(post_days)),
        }
    }

    pub fn contains(&self, index_time: NaiveDateTime, ts: NaiveDateTime) -> bool {
        // a bound past the datetime range clips to "everything" or "nothing"
        // depending on which way it overflowed
        let after_start = match self.pre {
            Some(pre) => match index_time.checked_add_signed(pre) {
                Some(start) => start <= ts,
                None => pre < TimeDelta::zero(),
            },
            None => true,
        };
        let before_end = match self.post {
            Some(post) => match index_time.checked_add_signed(post) {
                Some(end) => ts < end,
                None => post > TimeDelta::zero(),
            },
            None => true,
        };
        after_start && before_end
    }

    pub fn label(&self) -> String {
        format!("{}_{}", bound_label(self.pre), bound_label(self.post))
    }
}

fn bound_label(bound: Option<TimeDelta>) -> String {
    match bound {
        Some(delta) => delta
            .num_seconds()
            .div_euclid(SECONDS_PER_DAY)
            .to_string(),
        None => "None".to_string(),
    }
}

pub fn window_column_names(base_name: &str, window: &Window) -> Vec<String> {
    let label = window.label();
    WINDOW_SUFFIXES
        .iter()
        .map(|suffix| format!("{base_name}.{label}.{suffix}"))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowSummary {
    pub count: u64,
    pub count_in_range: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub first: Option<f64>,
    pub last: Option<f64>,
    pub diff: Option<f64>,
    pub slope: Option<f64>,
    pub proximate: Option<f64>,
    pub first_time_days: Option<f64>,
    pub last_time_days: Option<f64>,
    pub proximate_time_days: Option<f64>,
}

impl WindowSummary {
    pub fn values(&self) -> [FeatureValue; 15] {
        [
            FeatureValue::Count(self.count),
            FeatureValue::Count(self.count_in_range),
            FeatureValue::from_option(self.min),
            FeatureValue::from_option(self.max),
            FeatureValue::from_option(self.median),
            FeatureValue::from_option(self.mean),
            FeatureValue::from_option(self.std),
            FeatureValue::from_option(self.first),
            FeatureValue::from_option(self.last),
            FeatureValue::from_option(self.diff),
            FeatureValue::from_option(self.slope),
            FeatureValue::from_option(self.proximate),
            FeatureValue::from_option(self.first_time_days),
            FeatureValue::from_option(self.last_time_days),
            FeatureValue::from_option(self.proximate_time_days),
        ]
    }
}

/// Summarizes the in-window events of one base name for one index time.
///
/// `events` must be in ascending time order. Events without a value are
/// ignored. Ties: `first` and `last` keep the earliest scanned event among
/// equal timestamps, and `proximate` keeps the earliest scanned among equal
/// distances, which favours the event before the index time.
pub fn summarize<'a>(
    index_time: NaiveDateTime,
    window: &Window,
    events: impl IntoIterator<Item = &'a Event>,
) -> WindowSummary {
    let mut values = Vec::new();
    let mut count_in_range = 0_u64;
    let mut first: Option<(NaiveDateTime, f64)> = None;
    let mut last: Option<(NaiveDateTime, f64)> = None;
    let mut proximate: Option<(NaiveDateTime, f64, TimeDelta)> = None;

    for event in events {
        let Some(value) = event.value else {
            continue;
        };
        let ts = event.timestamp;
        if !window.contains(index_time, ts) {
            continue;
        }

        values.push(value);
        if event.in_range {
            count_in_range += 1;
        }
        if first.map_or(true, |(first_ts, _)| ts < first_ts) {
            first = Some((ts, value));
        }
        if last.map_or(true, |(last_ts, _)| last_ts < ts) {
            last = Some((ts, value));
        }
        let distance = (ts - index_time).abs();
        if proximate.map_or(true, |(_, _, best)| distance < best) {
            proximate = Some((ts, value, distance));
        }
    }

    let (Some((first_ts, first_value)), Some((last_ts, last_value)), Some((prox_ts, prox_value, _))) =
        (first, last, proximate)
    else {
        return WindowSummary::default();
    };

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let diff = last_value - first_value;
    let span_days = days_between(first_ts, last_ts);
    let slope = if span_days > 0.0 { diff / span_days } else { 0.0 };

    let mut sorted = values.clone();
    sorted.sort_by(f64::total_cmp);

    WindowSummary {
        count: values.len() as u64,
        count_in_range,
        min: sorted.first().copied(),
        max: sorted.last().copied(),
        median: Some(median_of_sorted(&sorted)),
        mean: Some(mean),
        std: Some(variance.sqrt()),
        first: Some(first_value),
        last: Some(last_value),
        diff: Some(diff),
        slope: Some(slope),
        proximate: Some(prox_value),
        first_time_days: Some(days_between(index_time, first_ts)),
        last_time_days: Some(days_between(index_time, last_ts)),
        proximate_time_days: Some(days_between(index_time, prox_ts)),
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowedAggregator {
    pub base_names: Vec<String>,
    pub window: Window,
}

impl WindowedAggregator {
    pub fn new(base_names: Vec<String>, window: Window) -> Self {
        Self { base_names, window }
    }

    pub fn columns(&self) -> Vec<FeatureColumn> {
        self.base_names
            .iter()
            .flat_map(|base_name| {
                window_column_names(base_name, &self.window)
                    .into_iter()
                    .zip(WINDOW_SUFFIXES)
                    .map(|(name, suffix)| {
                        let dtype = if suffix == "count" || suffix == "countInRange" {
                            FeatureDType::Count
                        } else {
                            FeatureDType::F64
                        };
                        FeatureColumn::new(name, dtype)
                    })
            })
            .collect()
    }

    pub fn apply(&self, index: &mut EpisodeIndex, stream: &EventStream) -> Result<(), MatrixError> {
        let columns = self.columns();
        index.register_columns(&columns)?;
        let Some(first_column) = columns.first() else {
            return Ok(());
        };
        let start = index
            .column_position(&first_column.name)
            .ok_or_else(|| MatrixError::UnknownColumn(first_column.name.clone()))?;

        let mut summarized = 0_u64;
        let mut non_empty = 0_u64;
        for patient in stream.iter() {
            let index_times = index.lookup(patient.patient_id()).to_vec();
            for index_time in index_times {
                let Some(slot) = index.slot_of(patient.patient_id(), index_time) else {
                    continue;
                };
                for (base_idx, base_name) in self.base_names.iter().enumerate() {
                    let summary = summarize(index_time, &self.window, patient.named(base_name));
                    summarized += 1;
                    if summary.count > 0 {
                        non_empty += 1;
                    }
                    let offset = start + base_idx * WINDOW_SUFFIXES.len();
                    for (k, value) in summary.values().into_iter().enumerate() {
                        index.set_slot_value(slot, offset + k, value);
                    }
                }
            }
        }

        info!(
            component = "window",
            event = "matrix.window.finish",
            base_names = ?self.base_names,
            window = %self.window.label(),
            summaries = summarized,
            non_empty_summaries = non_empty
        );
        Ok(())
    }
}
