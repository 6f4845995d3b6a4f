//! Normalized clinical event streams.
//!
//! Sources hand back loosely typed [`RawEvent`]s. [`EventStream::from_raw`]
//! turns them into per-patient, time-sorted [`Event`] lists and drops every
//! record the aggregators must never see: null or placeholder values, values
//! that do not convert to a number, and events without a timestamp.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

// Result values at or above this are placeholders, not measurements.
pub const DEFAULT_SENTINEL_RESULT_VALUE: f64 = 9_999_999.0;

const NULL_MARKERS: [&str; 4] = ["", "<null>", "null", "none"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemColumn {
    Name,
    Description,
}

impl ItemColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Description => "description",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSelector {
    LabResults { names: Vec<String>, by_panel: bool },
    Flowsheets { names: Vec<String> },
    ClinicalItems {
        patterns: Vec<String>,
        column: ItemColumn,
    },
    ClinicalItemCategories { category_ids: Vec<i64> },
}

impl EventSelector {
    pub fn carries_values(&self) -> bool {
        matches!(self, Self::LabResults { .. } | Self::Flowsheets { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LabResults { .. } => "lab_results",
            Self::Flowsheets { .. } => "flowsheets",
            Self::ClinicalItems { .. } => "clinical_items",
            Self::ClinicalItemCategories { .. } => "clinical_item_categories",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub patient_id: i64,
    pub base_name: String,
    pub value: Option<String>,
    pub timestamp: Option<NaiveDateTime>,
    pub in_range: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub patient_id: i64,
    pub base_name: String,
    pub value: Option<f64>,
    pub timestamp: NaiveDateTime,
    pub in_range: bool,
}

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord { line: u64, reason: String },
    #[error("event source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot convert value '{raw}' of {base_name} for patient {patient_id}: {reason}")]
pub struct ValueConversionError {
    pub patient_id: i64,
    pub base_name: String,
    pub raw: String,
    pub reason: String,
}

pub trait EventSource {
    /// Stable name of the source, used in cache keys and logs.
    fn label(&self) -> &str;

    fn fetch_events(
        &self,
        selector: &EventSelector,
        patient_ids: &BTreeSet<i64>,
    ) -> Result<Vec<RawEvent>, DataSourceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeReport {
    pub input_events: u64,
    pub kept_events: u64,
    pub null_values: u64,
    pub unparseable_values: u64,
    pub sentinel_values: u64,
    pub missing_timestamps: u64,
    pub foreign_patients: u64,
}

pub fn parse_event_value(raw: &RawEvent) -> Result<Option<f64>, ValueConversionError> {
    let Some(text) = raw.value.as_deref() else {
        return Ok(None);
    };
    let trimmed = text.trim();
    if NULL_MARKERS
        .iter()
        .any(|marker| trimmed.eq_ignore_ascii_case(marker))
    {
        return Ok(None);
    }

    let conversion_error = |reason: String| ValueConversionError {
        patient_id: raw.patient_id,
        base_name: raw.base_name.clone(),
        raw: text.to_string(),
        reason,
    };

    let value = trimmed
        .parse::<f64>()
        .map_err(|err| conversion_error(err.to_string()))?;
    if !value.is_finite() {
        return Err(conversion_error("value is not finite".to_string()));
    }
    Ok(Some(value))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatientEvents {
    patient_id: i64,
    events: Vec<Event>,
    by_name: BTreeMap<String, Vec<usize>>,
}

impl PatientEvents {
    fn new(patient_id: i64, mut events: Vec<Event>) -> Self {
        // Stable: equal timestamps keep source order.
        events.sort_by_key(|event| event.timestamp);
        let mut by_name: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, event) in events.iter().enumerate() {
            by_name
                .entry(event.base_name.clone())
                .or_default()
                .push(idx);
        }
        Self {
            patient_id,
            events,
            by_name,
        }
    }

    pub fn patient_id(&self) -> i64 {
        self.patient_id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn named<'a>(&'a self, base_name: &str) -> impl Iterator<Item = &'a Event> + 'a {
        self.by_name
            .get(base_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .map(move |idx| &self.events[*idx])
    }

    pub fn base_names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventStream {
    patients: Vec<PatientEvents>,
    positions: HashMap<i64, usize>,
    report: SanitizeReport,
}

impl EventStream {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_raw(
        raw_events: Vec<RawEvent>,
        carries_values: bool,
        sentinel_result_value: f64,
        patient_ids: &BTreeSet<i64>,
    ) -> Self {
        let mut report = SanitizeReport {
            input_events: raw_events.len() as u64,
            ..SanitizeReport::default()
        };
        let mut grouped: BTreeMap<i64, Vec<Event>> = BTreeMap::new();

        for raw in raw_events {
            if !patient_ids.contains(&raw.patient_id) {
                report.foreign_patients += 1;
                continue;
            }

            let value = if carries_values {
                match parse_event_value(&raw) {
                    Ok(Some(value)) if value >= sentinel_result_value => {
                        report.sentinel_values += 1;
                        continue;
                    }
                    Ok(Some(value)) => Some(value),
                    Ok(None) => {
                        report.null_values += 1;
                        continue;
                    }
                    Err(err) => {
                        warn!(
                            component = "events",
                            event = "events.sanitize.skipped_value",
                            patient_id = err.patient_id,
                            base_name = %err.base_name,
                            raw = %err.raw,
                            reason = %err.reason
                        );
                        report.unparseable_values += 1;
                        continue;
                    }
                }
            } else {
                None
            };

            let Some(timestamp) = raw.timestamp else {
                report.missing_timestamps += 1;
                continue;
            };

            grouped.entry(raw.patient_id).or_default().push(Event {
                patient_id: raw.patient_id,
                base_name: raw.base_name,
                value,
                timestamp,
                in_range: raw.in_range,
            });
            report.kept_events += 1;
        }

        let patients: Vec<PatientEvents> = grouped
            .into_iter()
            .map(|(patient_id, events)| PatientEvents::new(patient_id, events))
            .collect();
        let positions = patients
            .iter()
            .enumerate()
            .map(|(idx, patient)| (patient.patient_id, idx))
            .collect();

        debug!(
            component = "events",
            event = "events.sanitize.finish",
            input_events = report.input_events,
            kept_events = report.kept_events,
            null_values = report.null_values,
            unparseable_values = report.unparseable_values,
            sentinel_values = report.sentinel_values,
            missing_timestamps = report.missing_timestamps
        );

        Self {
            patients,
            positions,
            report,
        }
    }

    pub fn patient(&self, patient_id: i64) -> Option<&PatientEvents> {
        self.positions
            .get(&patient_id)
            .map(|idx| &self.patients[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatientEvents> {
        self.patients.iter()
    }

    pub fn patient_count(&self) -> usize {
        self.patients.len()
    }

    pub fn event_count(&self) -> usize {
        self.patients.iter().map(|p| p.events.len()).sum()
    }

    pub fn report(&self) -> &SanitizeReport {
        &self.report
    }
}

pub fn fetch_event_stream(
    source: &dyn EventSource,
    selector: &EventSelector,
    patient_ids: &BTreeSet<i64>,
    sentinel_result_value: f64,
) -> Result<EventStream, DataSourceError> {
    if patient_ids.is_empty() {
        return Ok(EventStream::empty());
    }

    let raw = source.fetch_events(selector, patient_ids)?;
    let stream = EventStream::from_raw(
        raw,
        selector.carries_values(),
        sentinel_result_value,
        patient_ids,
    );

    info!(
        component = "events",
        event = "events.fetch.finish",
        source = source.label(),
        selector = selector.kind(),
        patients_requested = patient_ids.len(),
        patients_with_events = stream.patient_count(),
        events = stream.event_count(),
        skipped_values = stream.report.unparseable_values
    );

    Ok(stream)
}
