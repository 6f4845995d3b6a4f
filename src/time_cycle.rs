//! Cyclical encodings of the index time (season, time of day, ...).

use std::f64::consts::PI;
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::episodes::EpisodeIndex;
use crate::matrix::{FeatureColumn, FeatureDType, FeatureValue, MatrixError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAttribute {
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl TimeAttribute {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Second => "second",
        }
    }

    fn bounds(self) -> (u32, u32) {
        match self {
            Self::Month => (1, 12),
            Self::Day => (1, 31),
            Self::Hour => (0, 23),
            Self::Minute | Self::Second => (0, 59),
        }
    }

    fn extract(self, ts: NaiveDateTime) -> u32 {
        match self {
            Self::Month => ts.month(),
            Self::Day => ts.day(),
            Self::Hour => ts.hour(),
            Self::Minute => ts.minute(),
            Self::Second => ts.second(),
        }
    }
}

impl FromStr for TimeAttribute {
    type Err = MatrixError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "month" => Ok(Self::Month),
            "day" => Ok(Self::Day),
            "hour" => Ok(Self::Hour),
            "minute" => Ok(Self::Minute),
            "second" => Ok(Self::Second),
            other => Err(MatrixError::InvalidRequest(format!(
                "unknown time attribute '{other}'"
            ))),
        }
    }
}

pub fn cycle_encoding(ts: NaiveDateTime, attribute: TimeAttribute) -> (u32, f64, f64) {
    let value = attribute.extract(ts);
    let (min, max) = attribute.bounds();
    let radians = 2.0 * PI * f64::from(value - min) / f64::from(max + 1 - min);
    (value, radians.sin(), radians.cos())
}

pub fn time_cycle_columns(time_column: &str, attribute: TimeAttribute) -> Vec<FeatureColumn> {
    let attr = attribute.as_str();
    vec![
        FeatureColumn::new(format!("{time_column}.{attr}"), FeatureDType::Count),
        FeatureColumn::new(format!("{time_column}.{attr}.sin"), FeatureDType::F64),
        FeatureColumn::new(format!("{time_column}.{attr}.cos"), FeatureDType::F64),
    ]
}

pub fn apply_time_cycle(index: &mut EpisodeIndex, attribute: TimeAttribute) -> Result<(), MatrixError> {
    let columns = time_cycle_columns(&index.key_columns().index_time, attribute);
    index.register_columns(&columns)?;
    let start = index
        .column_position(&columns[0].name)
        .ok_or_else(|| MatrixError::UnknownColumn(columns[0].name.clone()))?;

    let episodes = index.distinct_episodes().to_vec();
    for (slot, episode) in episodes.iter().enumerate() {
        let (value, sin, cos) = cycle_encoding(episode.index_time, attribute);
        index.set_slot_value(slot, start, FeatureValue::Count(u64::from(value)));
        index.set_slot_value(slot, start + 1, FeatureValue::Real(sin));
        index.set_slot_value(slot, start + 2, FeatureValue::Real(cos));
    }

    info!(
        component = "time_cycle",
        event = "matrix.time_cycle.finish",
        attribute = attribute.as_str(),
        episodes = episodes.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamps::parse_timestamp;

    #[test]
    fn cycle_starts_at_angle_zero() {
        let ts = parse_timestamp("2020-01-01 00:00:00").unwrap();
        let (value, sin, cos) = cycle_encoding(ts, TimeAttribute::Month);
        assert_eq!(value, 1);
        assert!(sin.abs() < 1e-12);
        assert!((cos - 1.0).abs() < 1e-12);
    }

    #[test]
    fn hour_six_is_a_quarter_turn() {
        let ts = parse_timestamp("2020-05-17 06:30:00").unwrap();
        let (value, sin, cos) = cycle_encoding(ts, TimeAttribute::Hour);
        assert_eq!(value, 6);
        assert!((sin - 1.0).abs() < 1e-12);
        assert!(cos.abs() < 1e-12);
    }

    #[test]
    fn parses_attribute_names() {
        assert_eq!("Month".parse::<TimeAttribute>().unwrap(), TimeAttribute::Month);
        assert!("fortnight".parse::<TimeAttribute>().is_err());
    }
}
