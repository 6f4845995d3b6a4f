//! Patient episode index: the (patient, index time) anchors every feature is
//! computed against, plus the feature record each episode accumulates.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::DataSourceError;
use crate::matrix::{FeatureColumn, FeatureValue, MatrixError};
use crate::timestamps::{format_timestamp, parse_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Episode {
    pub patient_id: i64,
    pub index_time: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeRecord {
    pub patient_id: String,
    pub index_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeColumns {
    pub patient_id: String,
    pub index_time: String,
}

impl Default for EpisodeColumns {
    fn default() -> Self {
        Self {
            patient_id: "patient_id".to_string(),
            index_time: "index_time".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpisodeIndex {
    key_columns: EpisodeColumns,
    // input row -> record slot; duplicate input rows share a slot
    rows: Vec<usize>,
    slots: Vec<Episode>,
    slot_by_episode: HashMap<Episode, usize>,
    times_by_patient: BTreeMap<i64, Vec<NaiveDateTime>>,
    feature_columns: Vec<FeatureColumn>,
    column_positions: HashMap<String, usize>,
    records: Vec<Vec<FeatureValue>>,
}

impl EpisodeIndex {
    pub fn from_episodes(
        key_columns: EpisodeColumns,
        episodes: impl IntoIterator<Item = Episode>,
    ) -> Self {
        let mut index = Self {
            key_columns,
            rows: Vec::new(),
            slots: Vec::new(),
            slot_by_episode: HashMap::new(),
            times_by_patient: BTreeMap::new(),
            feature_columns: Vec::new(),
            column_positions: HashMap::new(),
            records: Vec::new(),
        };

        for episode in episodes {
            let slot = match index.slot_by_episode.get(&episode) {
                Some(slot) => *slot,
                None => {
                    let slot = index.slots.len();
                    index.slots.push(episode);
                    index.slot_by_episode.insert(episode, slot);
                    index
                        .times_by_patient
                        .entry(episode.patient_id)
                        .or_default()
                        .push(episode.index_time);
                    index.records.push(Vec::new());
                    slot
                }
            };
            index.rows.push(slot);
        }

        info!(
            component = "episodes",
            event = "matrix.episodes.loaded",
            rows = index.rows.len(),
            distinct_episodes = index.slots.len(),
            patients = index.times_by_patient.len()
        );

        index
    }

    pub fn from_records(
        key_columns: EpisodeColumns,
        records: impl IntoIterator<Item = EpisodeRecord>,
    ) -> Result<Self, DataSourceError> {
        let mut episodes = Vec::new();
        for (idx, record) in records.into_iter().enumerate() {
            episodes.push(parse_episode(&record, idx as u64 + 1)?);
        }
        Ok(Self::from_episodes(key_columns, episodes))
    }

    pub fn key_columns(&self) -> &EpisodeColumns {
        &self.key_columns
    }

    pub fn lookup(&self, patient_id: i64) -> &[NaiveDateTime] {
        self.times_by_patient
            .get(&patient_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_patient_ids(&self) -> BTreeSet<i64> {
        self.times_by_patient.keys().copied().collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Episode> {
        self.rows.iter().map(|slot| &self.slots[*slot])
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn distinct_episodes(&self) -> &[Episode] {
        &self.slots
    }

    pub fn feature_columns(&self) -> &[FeatureColumn] {
        &self.feature_columns
    }

    pub fn register_columns(&mut self, columns: &[FeatureColumn]) -> Result<(), MatrixError> {
        let mut incoming = BTreeSet::new();
        for column in columns {
            let taken = column.name == self.key_columns.patient_id
                || column.name == self.key_columns.index_time
                || self.column_positions.contains_key(&column.name)
                || !incoming.insert(column.name.as_str());
            if taken {
                return Err(MatrixError::ColumnCollision {
                    column: column.name.clone(),
                });
            }
        }

        for column in columns {
            self.column_positions
                .insert(column.name.clone(), self.feature_columns.len());
            self.feature_columns.push(column.clone());
            for record in &mut self.records {
                record.push(column.default_value());
            }
        }
        Ok(())
    }

    pub fn column_position(&self, column: &str) -> Option<usize> {
        self.column_positions.get(column).copied()
    }

    pub fn record_feature(
        &mut self,
        patient_id: i64,
        index_time: NaiveDateTime,
        column: &str,
        value: FeatureValue,
    ) -> Result<(), MatrixError> {
        let episode = Episode {
            patient_id,
            index_time,
        };
        let slot = *self
            .slot_by_episode
            .get(&episode)
            .ok_or_else(|| MatrixError::UnknownEpisode {
                patient_id,
                index_time: format_timestamp(index_time),
            })?;
        let position = self
            .column_position(column)
            .ok_or_else(|| MatrixError::UnknownColumn(column.to_string()))?;
        self.records[slot][position] = value;
        Ok(())
    }

    pub fn feature(
        &self,
        patient_id: i64,
        index_time: NaiveDateTime,
        column: &str,
    ) -> Option<&FeatureValue> {
        let slot = self.slot_by_episode.get(&Episode {
            patient_id,
            index_time,
        })?;
        let position = self.column_position(column)?;
        self.records[*slot].get(position)
    }

    pub(crate) fn slot_of(&self, patient_id: i64, index_time: NaiveDateTime) -> Option<usize> {
        self.slot_by_episode
            .get(&Episode {
                patient_id,
                index_time,
            })
            .copied()
    }

    pub(crate) fn set_slot_value(&mut self, slot: usize, position: usize, value: FeatureValue) {
        self.records[slot][position] = value;
    }

    pub fn row_record(&self, row: usize) -> &[FeatureValue] {
        &self.records[self.rows[row]]
    }
}

fn parse_episode(record: &EpisodeRecord, line: u64) -> Result<Episode, DataSourceError> {
    let patient_id = record
        .patient_id
        .trim()
        .parse::<i64>()
        .map_err(|err| DataSourceError::MalformedRecord {
            line,
            reason: format!("patient id '{}': {err}", record.patient_id),
        })?;
    let index_time =
        parse_timestamp(&record.index_time).ok_or_else(|| DataSourceError::MalformedRecord {
            line,
            reason: format!("unparseable index time '{}'", record.index_time),
        })?;
    Ok(Episode {
        patient_id,
        index_time,
    })
}

pub fn read_episodes_tsv(
    path: &Path,
    key_columns: &EpisodeColumns,
) -> Result<Vec<EpisodeRecord>, DataSourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|header| header == name)
            .ok_or_else(|| DataSourceError::MalformedRecord {
                line: 1,
                reason: format!("missing column '{name}' in {}", path.display()),
            })
    };
    let id_idx = position(&key_columns.patient_id)?;
    let time_idx = position(&key_columns.index_time)?;

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        let field = |idx: usize| {
            record
                .get(idx)
                .map(str::to_string)
                .ok_or_else(|| DataSourceError::MalformedRecord {
                    line,
                    reason: format!("row has {} fields", record.len()),
                })
        };
        records.push(EpisodeRecord {
            patient_id: field(id_idx)?,
            index_time: field(time_idx)?,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::FeatureDType;

    fn record(id: &str, time: &str) -> EpisodeRecord {
        EpisodeRecord {
            patient_id: id.to_string(),
            index_time: time.to_string(),
        }
    }

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).unwrap()
    }

    #[test]
    fn lookup_groups_times_per_patient_in_load_order() {
        let index = EpisodeIndex::from_records(
            EpisodeColumns::default(),
            vec![
                record("2", "2020-03-01"),
                record("1", "2020-01-10"),
                record("2", "2020-02-01"),
            ],
        )
        .unwrap();

        assert_eq!(index.lookup(2), &[ts("2020-03-01"), ts("2020-02-01")]);
        assert_eq!(index.lookup(1), &[ts("2020-01-10")]);
        assert!(index.lookup(9).is_empty());
        assert_eq!(index.all_patient_ids().into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn malformed_rows_report_their_line() {
        let err = EpisodeIndex::from_records(
            EpisodeColumns::default(),
            vec![record("1", "2020-01-10"), record("abc", "2020-01-10")],
        )
        .expect_err("non-integer id");
        assert!(matches!(err, DataSourceError::MalformedRecord { line: 2, .. }));

        let err = EpisodeIndex::from_records(
            EpisodeColumns::default(),
            vec![record("1", "not a time")],
        )
        .expect_err("bad time");
        assert!(matches!(err, DataSourceError::MalformedRecord { line: 1, .. }));
    }

    #[test]
    fn registered_columns_default_for_every_episode() {
        let mut index = EpisodeIndex::from_records(
            EpisodeColumns::default(),
            vec![record("1", "2020-01-10"), record("2", "2020-01-11")],
        )
        .unwrap();
        index
            .register_columns(&[
                FeatureColumn::new("NA.pre", FeatureDType::Count),
                FeatureColumn::new("NA.preTimeDays", FeatureDType::F64),
            ])
            .unwrap();

        assert_eq!(
            index.feature(2, ts("2020-01-11"), "NA.pre"),
            Some(&FeatureValue::Count(0))
        );
        assert_eq!(
            index.feature(2, ts("2020-01-11"), "NA.preTimeDays"),
            Some(&FeatureValue::Missing)
        );

        index
            .record_feature(1, ts("2020-01-10"), "NA.pre", FeatureValue::Count(3))
            .unwrap();
        assert_eq!(index.row_record(0)[0], FeatureValue::Count(3));
        assert_eq!(index.row_record(1)[0], FeatureValue::Count(0));
    }

    #[test]
    fn collisions_and_unknown_targets_are_errors() {
        let mut index =
            EpisodeIndex::from_records(EpisodeColumns::default(), vec![record("1", "2020-01-10")])
                .unwrap();
        index
            .register_columns(&[FeatureColumn::new("NA.pre", FeatureDType::Count)])
            .unwrap();

        for name in ["NA.pre", "patient_id", "index_time"] {
            let err = index
                .register_columns(&[FeatureColumn::new(name, FeatureDType::Count)])
                .expect_err("collision");
            assert!(matches!(err, MatrixError::ColumnCollision { .. }), "{name}");
        }
        let err = index
            .register_columns(&[
                FeatureColumn::new("K.pre", FeatureDType::Count),
                FeatureColumn::new("K.pre", FeatureDType::Count),
            ])
            .expect_err("duplicate within one batch");
        assert!(matches!(err, MatrixError::ColumnCollision { .. }));
        assert_eq!(index.feature_columns().len(), 1);

        assert!(matches!(
            index.record_feature(1, ts("2020-01-11"), "NA.pre", FeatureValue::Count(1)),
            Err(MatrixError::UnknownEpisode { .. })
        ));
        assert!(matches!(
            index.record_feature(1, ts("2020-01-10"), "NA.post", FeatureValue::Count(1)),
            Err(MatrixError::UnknownColumn(_))
        ));
    }

    #[test]
    fn duplicate_rows_share_one_record() {
        let mut index = EpisodeIndex::from_records(
            EpisodeColumns::default(),
            vec![record("1", "2020-01-10"), record("1", "2020-01-10 00:00:00")],
        )
        .unwrap();
        assert_eq!(index.row_count(), 2);
        assert_eq!(index.distinct_episodes().len(), 1);
        index
            .register_columns(&[FeatureColumn::new("NA.pre", FeatureDType::Count)])
            .unwrap();
        index
            .record_feature(1, ts("2020-01-10"), "NA.pre", FeatureValue::Count(2))
            .unwrap();
        assert_eq!(index.row_record(1)[0], FeatureValue::Count(2));
    }

    #[test]
    fn reads_tab_separated_lists_with_custom_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episodes.tsv");
        std::fs::write(
            &path,
            "# cohort export\npat_id\tnote\torder_time\n1\tx\t2020-01-10 08:00:00\n2\ty\t2020-01-11\n",
        )
        .unwrap();
        let columns = EpisodeColumns {
            patient_id: "pat_id".to_string(),
            index_time: "order_time".to_string(),
        };
        let records = read_episodes_tsv(&path, &columns).unwrap();
        assert_eq!(records, vec![
            record("1", "2020-01-10 08:00:00"),
            record("2", "2020-01-11"),
        ]);

        let err = read_episodes_tsv(&path, &EpisodeColumns::default()).expect_err("no patient_id");
        assert!(matches!(err, DataSourceError::MalformedRecord { line: 1, .. }));
    }
}
