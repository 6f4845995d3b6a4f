//! In-memory event tables implementing [`EventSource`].

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;

use crate::events::{DataSourceError, EventSelector, EventSource, ItemColumn, RawEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct LabResultRow {
    pub patient_id: i64,
    pub proc_code: String,
    pub base_name: String,
    pub value: Option<String>,
    pub in_range: bool,
    pub result_time: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowsheetRow {
    pub patient_id: i64,
    pub name: String,
    pub value: Option<String>,
    pub recorded_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogItem {
    pub clinical_item_id: i64,
    pub category_id: i64,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientItemRow {
    pub patient_id: i64,
    pub clinical_item_id: i64,
    pub item_date: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEventSource {
    label: String,
    lab_results: Vec<LabResultRow>,
    flowsheets: Vec<FlowsheetRow>,
    catalog: Vec<CatalogItem>,
    patient_items: Vec<PatientItemRow>,
}

impl MemoryEventSource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_lab_result(mut self, row: LabResultRow) -> Self {
        self.lab_results.push(row);
        self
    }

    pub fn with_flowsheet(mut self, row: FlowsheetRow) -> Self {
        self.flowsheets.push(row);
        self
    }

    pub fn with_catalog_item(mut self, item: CatalogItem) -> Self {
        self.catalog.push(item);
        self
    }

    pub fn with_patient_item(mut self, row: PatientItemRow) -> Self {
        self.patient_items.push(row);
        self
    }

    fn item_events<F>(&self, patient_ids: &BTreeSet<i64>, matches: F) -> Vec<RawEvent>
    where
        F: Fn(&CatalogItem) -> bool,
    {
        let names: HashMap<i64, &str> = self
            .catalog
            .iter()
            .filter(|item| matches(item))
            .map(|item| (item.clinical_item_id, item.name.as_str()))
            .collect();
        if names.is_empty() {
            return Vec::new();
        }

        self.patient_items
            .iter()
            .filter(|row| patient_ids.contains(&row.patient_id))
            .filter_map(|row| {
                names.get(&row.clinical_item_id).map(|name| RawEvent {
                    patient_id: row.patient_id,
                    base_name: (*name).to_string(),
                    value: None,
                    timestamp: row.item_date,
                    in_range: false,
                })
            })
            .collect()
    }
}

impl EventSource for MemoryEventSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn fetch_events(
        &self,
        selector: &EventSelector,
        patient_ids: &BTreeSet<i64>,
    ) -> Result<Vec<RawEvent>, DataSourceError> {
        let events = match selector {
            EventSelector::LabResults { names, by_panel } => self
                .lab_results
                .iter()
                .filter(|row| patient_ids.contains(&row.patient_id))
                .filter(|row| {
                    let key = if *by_panel {
                        &row.proc_code
                    } else {
                        &row.base_name
                    };
                    names.contains(key)
                })
                .map(|row| RawEvent {
                    patient_id: row.patient_id,
                    base_name: row.base_name.clone(),
                    value: row.value.clone(),
                    timestamp: row.result_time,
                    in_range: row.in_range,
                })
                .collect(),
            EventSelector::Flowsheets { names } => self
                .flowsheets
                .iter()
                .filter(|row| patient_ids.contains(&row.patient_id) && names.contains(&row.name))
                .map(|row| RawEvent {
                    patient_id: row.patient_id,
                    base_name: row.name.clone(),
                    value: row.value.clone(),
                    timestamp: row.recorded_at,
                    in_range: false,
                })
                .collect(),
            EventSelector::ClinicalItems { patterns, column } => {
                self.item_events(patient_ids, |item| {
                    let text = match column {
                        ItemColumn::Name => &item.name,
                        ItemColumn::Description => &item.description,
                    };
                    patterns.iter().any(|pattern| like_match(pattern, text))
                })
            }
            EventSelector::ClinicalItemCategories { category_ids } => {
                self.item_events(patient_ids, |item| category_ids.contains(&item.category_id))
            }
        };
        Ok(events)
    }
}

/// SQL `LIKE` semantics: `%` spans any run, `_` one character, ASCII case
/// folded.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();
    let text: Vec<char> = text.chars().map(|c| c.to_ascii_lowercase()).collect();

    // matched[j]: pattern prefix consumed so far matches text[..j]
    let mut matched = vec![false; text.len() + 1];
    matched[0] = true;
    for p in &pattern {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut reachable = false;
                for j in 0..=text.len() {
                    reachable |= matched[j];
                    next[j] = reachable;
                }
            }
            _ => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1] && (*p == '_' || *p == text[j - 1]);
                }
            }
        }
        matched = next;
    }
    matched[text.len()]
}
