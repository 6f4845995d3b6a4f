//! Feature matrix assembly and TSV output.

use std::fmt;
use std::io::Write;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::episodes::{Episode, EpisodeIndex};
use crate::events::DataSourceError;
use crate::timestamps::format_timestamp;

pub const NULL_TEXT: &str = "None";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    Count,
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

impl FeatureColumn {
    pub fn new(name: impl Into<String>, dtype: FeatureDType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }

    pub fn default_value(&self) -> FeatureValue {
        match self.dtype {
            FeatureDType::Count => FeatureValue::Count(0),
            FeatureDType::F64 => FeatureValue::Missing,
        }
    }
}

/// A cell. `Missing` and `Count(0)` are different answers and stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Missing,
    Count(u64),
    Real(f64),
}

impl FeatureValue {
    pub fn from_option(value: Option<f64>) -> Self {
        value.map_or(Self::Missing, Self::Real)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Missing => None,
            Self::Count(count) => Some(*count as f64),
            Self::Real(value) => Some(*value),
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str(NULL_TEXT),
            Self::Count(count) => write!(f, "{count}"),
            // Debug keeps the trailing ".0" and round-trips exactly
            Self::Real(value) => write!(f, "{value:?}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    DataSource(#[from] DataSourceError),
    #[error("feature column '{column}' is produced by more than one feature source")]
    ColumnCollision { column: String },
    #[error("no episode for patient {patient_id} at {index_time}")]
    UnknownEpisode { patient_id: i64, index_time: String },
    #[error("unknown feature column '{0}'")]
    UnknownColumn(String),
    #[error("invalid feature request: {0}")]
    InvalidRequest(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRow {
    pub episode: Episode,
    pub values: Vec<FeatureValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub patient_id_column: String,
    pub index_time_column: String,
    pub columns: Vec<FeatureColumn>,
    pub rows: Vec<MatrixRow>,
}

impl FeatureMatrix {
    pub fn assemble(index: &EpisodeIndex) -> Self {
        let rows: Vec<MatrixRow> = index
            .rows()
            .enumerate()
            .map(|(row, episode)| MatrixRow {
                episode: *episode,
                values: index.row_record(row).to_vec(),
            })
            .collect();
        let matrix = Self {
            patient_id_column: index.key_columns().patient_id.clone(),
            index_time_column: index.key_columns().index_time.clone(),
            columns: index.feature_columns().to_vec(),
            rows,
        };

        info!(
            component = "matrix",
            event = "matrix.assemble.finish",
            rows = matrix.rows.len(),
            feature_columns = matrix.columns.len(),
            fingerprint = %matrix.schema_fingerprint()
        );

        matrix
    }

    pub fn header(&self) -> Vec<&str> {
        let mut header = vec![
            self.patient_id_column.as_str(),
            self.index_time_column.as_str(),
        ];
        header.extend(self.columns.iter().map(|column| column.name.as_str()));
        header
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<FeatureValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| r.values[idx])
    }

    pub fn schema_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update("columns:");
        for name in self.header() {
            hasher.update(name.as_bytes());
            hasher.update(";");
        }
        hex::encode(hasher.finalize())
    }

    pub fn write_tsv<W: Write>(&self, mut out: W, comments: &[String]) -> Result<(), MatrixError> {
        for line in comments {
            writeln!(out, "# {line}")?;
        }

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Never)
            .from_writer(out);
        writer.write_record(self.header())?;

        let mut fields = Vec::with_capacity(self.columns.len() + 2);
        for row in &self.rows {
            fields.clear();
            fields.push(row.episode.patient_id.to_string());
            fields.push(format_timestamp(row.episode.index_time));
            fields.extend(row.values.iter().map(FeatureValue::to_string));
            writer.write_record(&fields)?;
        }
        writer.flush()?;
        Ok(())
    }
}
