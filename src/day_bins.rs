//! Cumulative pre/post event counts at day-distance cutoffs.
//!
//! Unlike the windowed aggregator this always looks at the patient's whole
//! timeline, split at the index time. An event exactly at the index time
//! counts as `post`.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::episodes::EpisodeIndex;
use crate::events::{Event, EventStream};
use crate::matrix::{FeatureColumn, FeatureDType, FeatureValue, MatrixError};
use crate::timestamps::days_between;

pub const DEFAULT_DAY_BINS: [u32; 11] = [1, 2, 4, 7, 14, 30, 90, 180, 365, 730, 1460];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSide {
    Pre,
    Post,
    #[default]
    All,
}

impl FeatureSide {
    fn includes_pre(self) -> bool {
        !matches!(self, Self::Post)
    }

    fn includes_post(self) -> bool {
        !matches!(self, Self::Pre)
    }
}

pub fn item_label(names: &[String], label: Option<&str>) -> String {
    match label {
        Some(label) => label.to_string(),
        None => names.join("-"),
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SideCounts {
    pub nearest_days: Option<f64>,
    pub total: u64,
    pub within: Vec<u64>,
}

impl SideCounts {
    fn new(bins: usize) -> Self {
        Self {
            nearest_days: None,
            total: 0,
            within: vec![0; bins],
        }
    }

    fn observe(&mut self, diff_days: f64, day_bins: &[u32]) {
        if self
            .nearest_days
            .map_or(true, |nearest| diff_days.abs() < nearest.abs())
        {
            self.nearest_days = Some(diff_days);
        }
        self.total += 1;
        for (slot, bin) in self.within.iter_mut().zip(day_bins) {
            if diff_days.abs() <= f64::from(*bin) {
                *slot += 1;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DayBinSummary {
    pub pre: SideCounts,
    pub post: SideCounts,
}

pub fn count_day_bins<'a>(
    index_time: NaiveDateTime,
    day_bins: &[u32],
    events: impl IntoIterator<Item = &'a Event>,
) -> DayBinSummary {
    let mut summary = DayBinSummary {
        pre: SideCounts::new(day_bins.len()),
        post: SideCounts::new(day_bins.len()),
    };
    for event in events {
        let diff_days = days_between(index_time, event.timestamp);
        if diff_days < 0.0 {
            summary.pre.observe(diff_days, day_bins);
        } else {
            summary.post.observe(diff_days, day_bins);
        }
    }
    summary
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayBinCounter {
    pub label: String,
    pub day_bins: Vec<u32>,
    pub side: FeatureSide,
}

impl DayBinCounter {
    pub fn new(label: impl Into<String>, day_bins: Vec<u32>, side: FeatureSide) -> Self {
        Self {
            label: label.into(),
            day_bins,
            side,
        }
    }

    pub fn columns(&self) -> Vec<FeatureColumn> {
        let mut columns = Vec::new();
        if self.side.includes_pre() {
            self.push_side_columns(&mut columns, "pre");
        }
        if self.side.includes_post() {
            self.push_side_columns(&mut columns, "post");
        }
        columns
    }

    fn push_side_columns(&self, columns: &mut Vec<FeatureColumn>, side: &str) {
        let label = &self.label;
        columns.push(FeatureColumn::new(
            format!("{label}.{side}TimeDays"),
            FeatureDType::F64,
        ));
        columns.push(FeatureColumn::new(
            format!("{label}.{side}"),
            FeatureDType::Count,
        ));
        for bin in &self.day_bins {
            columns.push(FeatureColumn::new(
                format!("{label}.{side}_{bin}d"),
                FeatureDType::Count,
            ));
        }
    }

    fn side_values(counts: &SideCounts) -> impl Iterator<Item = FeatureValue> + '_ {
        [
            FeatureValue::from_option(counts.nearest_days),
            FeatureValue::Count(counts.total),
        ]
        .into_iter()
        .chain(counts.within.iter().map(|n| FeatureValue::Count(*n)))
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

        let mut episodes_with_events = 0_u64;
        for patient in stream.iter() {
            let index_times = index.lookup(patient.patient_id()).to_vec();
            for index_time in index_times {
                let Some(slot) = index.slot_of(patient.patient_id(), index_time) else {
                    continue;
                };
                let summary = count_day_bins(index_time, &self.day_bins, patient.events());
                episodes_with_events += 1;

                let mut values: Vec<FeatureValue> = Vec::with_capacity(columns.len());
                if self.side.includes_pre() {
                    values.extend(Self::side_values(&summary.pre));
                }
                if self.side.includes_post() {
                    values.extend(Self::side_values(&summary.post));
                }
                for (k, value) in values.into_iter().enumerate() {
                    index.set_slot_value(slot, start + k, value);
                }
            }
        }

        info!(
            component = "day_bins",
            event = "matrix.day_bins.finish",
            label = %self.label,
            day_bins = ?self.day_bins,
            side = ?self.side,
            episodes_with_events = episodes_with_events
        );
        Ok(())
    }
}
