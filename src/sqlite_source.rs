//! SQLite-backed [`EventSource`].
//!
//! Expected layout (extra columns are ignored):
//!
//! ```text
//! lab_results(pat_id, proc_code, base_name, ord_num_value, result_in_range_yn, result_time)
//! flowsheet(pat_id, flowsheet_name, flowsheet_value, shifted_dt_tm)
//! clinical_item(clinical_item_id, clinical_item_category_id, name, description)
//! patient_item(patient_id, clinical_item_id, item_date)
//! ```
//!
//! Timestamps are stored as text in any layout `parse_timestamp` accepts.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, Row};
use tracing::{debug, warn};

use crate::events::{DataSourceError, EventSelector, EventSource, RawEvent};
use crate::timestamps::parse_timestamp;

// Well under SQLITE_MAX_VARIABLE_NUMBER once the name list is added.
const PATIENT_ID_CHUNK: usize = 500;

pub struct SqliteEventSource {
    label: String,
    conn: Connection,
}

impl SqliteEventSource {
    pub fn open(path: &Path) -> Result<Self, DataSourceError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| {
            DataSourceError::Unavailable(format!("cannot open {}: {err}", path.display()))
        })?;
        Ok(Self {
            label: format!("sqlite:{}", path.display()),
            conn,
        })
    }

    pub fn from_connection(label: impl Into<String>, conn: Connection) -> Self {
        Self {
            label: label.into(),
            conn,
        }
    }

    fn query_chunked<F>(
        &self,
        sql_for: impl Fn(usize) -> String,
        leading: &[Value],
        patient_ids: &BTreeSet<i64>,
        map_row: F,
    ) -> Result<Vec<RawEvent>, DataSourceError>
    where
        F: Fn(&Row<'_>) -> Result<RawEvent, rusqlite::Error>,
    {
        let ids: Vec<i64> = patient_ids.iter().copied().collect();
        let mut out = Vec::new();

        for chunk in ids.chunks(PATIENT_ID_CHUNK) {
            let sql = sql_for(chunk.len());
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let params: Vec<Value> = leading
                .iter()
                .cloned()
                .chain(chunk.iter().map(|id| Value::Integer(*id)))
                .collect();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            while let Some(row) = rows.next()? {
                out.push(map_row(row)?);
            }
        }

        debug!(
            component = "sqlite_source",
            event = "sqlite_source.query.finish",
            source = %self.label,
            rows = out.len()
        );
        Ok(out)
    }

    fn lab_results(
        &self,
        names: &[String],
        by_panel: bool,
        patient_ids: &BTreeSet<i64>,
    ) -> Result<Vec<RawEvent>, DataSourceError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let match_column = if by_panel { "proc_code" } else { "base_name" };
        let leading: Vec<Value> = names.iter().map(|n| Value::Text(n.clone())).collect();
        let name_vars = placeholders(1, names.len());

        self.query_chunked(
            |chunk_len| {
                format!(
                    "SELECT pat_id, base_name, ord_num_value, result_in_range_yn, result_time
                     FROM lab_results
                     WHERE {match_column} IN ({name_vars})
                       AND pat_id IN ({})
                     ORDER BY pat_id ASC, result_time ASC",
                    placeholders(names.len() + 1, chunk_len)
                )
            },
            &leading,
            patient_ids,
            |row| {
                Ok(RawEvent {
                    patient_id: row.get(0)?,
                    base_name: row.get(1)?,
                    value: value_text(row.get_ref(2)?),
                    in_range: value_text(row.get_ref(3)?).as_deref() == Some("Y"),
                    timestamp: timestamp_at(row, 4)?,
                })
            },
        )
    }

    fn flowsheets(
        &self,
        names: &[String],
        patient_ids: &BTreeSet<i64>,
    ) -> Result<Vec<RawEvent>, DataSourceError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let leading: Vec<Value> = names.iter().map(|n| Value::Text(n.clone())).collect();
        let name_vars = placeholders(1, names.len());

        self.query_chunked(
            |chunk_len| {
                format!(
                    "SELECT pat_id, flowsheet_name, flowsheet_value, shifted_dt_tm
                     FROM flowsheet
                     WHERE flowsheet_name IN ({name_vars})
                       AND pat_id IN ({})
                     ORDER BY pat_id ASC, shifted_dt_tm ASC",
                    placeholders(names.len() + 1, chunk_len)
                )
            },
            &leading,
            patient_ids,
            |row| {
                Ok(RawEvent {
                    patient_id: row.get(0)?,
                    base_name: row.get(1)?,
                    value: value_text(row.get_ref(2)?),
                    in_range: false,
                    timestamp: timestamp_at(row, 3)?,
                })
            },
        )
    }

    // Item events joined to their catalog names. `catalog_clause` filters
    // `clinical_item` (aliased `ci`) and binds `?1..` from `catalog_params`.
    fn patient_items(
        &self,
        catalog_clause: &str,
        catalog_params: &[Value],
        patient_ids: &BTreeSet<i64>,
    ) -> Result<Vec<RawEvent>, DataSourceError> {
        self.query_chunked(
            |chunk_len| {
                format!(
                    "SELECT pi.patient_id, ci.name, pi.item_date
                     FROM patient_item pi
                     JOIN clinical_item ci ON ci.clinical_item_id = pi.clinical_item_id
                     WHERE ({catalog_clause})
                       AND pi.patient_id IN ({})
                     ORDER BY pi.patient_id ASC, pi.item_date ASC",
                    placeholders(catalog_params.len() + 1, chunk_len)
                )
            },
            catalog_params,
            patient_ids,
            |row| {
                Ok(RawEvent {
                    patient_id: row.get(0)?,
                    base_name: row.get(1)?,
                    value: None,
                    in_range: false,
                    timestamp: timestamp_at(row, 2)?,
                })
            },
        )
    }
}

impl EventSource for SqliteEventSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn fetch_events(
        &self,
        selector: &EventSelector,
        patient_ids: &BTreeSet<i64>,
    ) -> Result<Vec<RawEvent>, DataSourceError> {
        match selector {
            EventSelector::LabResults { names, by_panel } => {
                self.lab_results(names, *by_panel, patient_ids)
            }
            EventSelector::Flowsheets { names } => self.flowsheets(names, patient_ids),
            EventSelector::ClinicalItems { patterns, column } => {
                if patterns.is_empty() {
                    return Ok(Vec::new());
                }
                let clause = patterns
                    .iter()
                    .enumerate()
                    .map(|(idx, _)| format!("ci.{} LIKE ?{}", column.as_str(), idx + 1))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                let params: Vec<Value> =
                    patterns.iter().map(|p| Value::Text(p.clone())).collect();
                self.patient_items(&clause, &params, patient_ids)
            }
            EventSelector::ClinicalItemCategories { category_ids } => {
                if category_ids.is_empty() {
                    return Ok(Vec::new());
                }
                let clause = format!(
                    "ci.clinical_item_category_id IN ({})",
                    placeholders(1, category_ids.len())
                );
                let params: Vec<Value> =
                    category_ids.iter().map(|id| Value::Integer(*id)).collect();
                self.patient_items(&clause, &params, patient_ids)
            }
        }
    }
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn value_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(v) => Some(v.to_string()),
        ValueRef::Real(v) => Some(v.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn timestamp_at(
    row: &Row<'_>,
    idx: usize,
) -> Result<Option<chrono::NaiveDateTime>, rusqlite::Error> {
    let Some(text) = value_text(row.get_ref(idx)?) else {
        return Ok(None);
    };
    let parsed = parse_timestamp(&text);
    if parsed.is_none() {
        warn!(
            component = "sqlite_source",
            event = "sqlite_source.timestamp.unparseable",
            raw = %text
        );
    }
    Ok(parsed)
}
