//! One matrix-build session.
//!
//! Load episodes first, then add feature groups one call at a time, then
//! [`FeatureMatrixFactory::build`]. Each call fetches its events through the
//! session's source and cache and writes its columns into the episode index.

use std::path::Path;

use tracing::info;

use crate::cache::{CacheKey, EventCache};
use crate::config::BuildConfig;
use crate::day_bins::{item_label, DayBinCounter, FeatureSide};
use crate::episodes::{read_episodes_tsv, Episode, EpisodeColumns, EpisodeIndex, EpisodeRecord};
use crate::events::{fetch_event_stream, EventSelector, EventSource, EventStream, ItemColumn};
use crate::matrix::{FeatureMatrix, MatrixError};
use crate::plan::ItemGroups;
use crate::time_cycle::{apply_time_cycle, TimeAttribute};
use crate::window::{Window, WindowedAggregator};

pub const SEX_FEATURES: [&str; 2] = ["Male", "Female"];

pub const DEFAULT_RACE_FEATURES: [&str; 9] = [
    "RaceWhiteHispanicLatino",
    "RaceWhiteNonHispanicLatino",
    "RaceHispanicLatino",
    "RaceBlack",
    "RaceAsian",
    "RacePacificIslander",
    "RaceNativeAmerican",
    "RaceOther",
    "RaceUnknown",
];

pub struct FeatureMatrixFactory {
    config: BuildConfig,
    source: Box<dyn EventSource>,
    episodes: Option<EpisodeIndex>,
    cache: EventCache,
    feature_calls: usize,
}

impl FeatureMatrixFactory {
    pub fn new(source: Box<dyn EventSource>, config: BuildConfig) -> Self {
        let cache = EventCache::new(config.cache_events);
        Self {
            config,
            source,
            episodes: None,
            cache,
            feature_calls: 0,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }

    pub fn episodes(&self) -> Option<&EpisodeIndex> {
        self.episodes.as_ref()
    }

    pub fn load_episode_index(&mut self, index: EpisodeIndex) -> usize {
        let rows = index.row_count();
        self.cache.clear();
        self.feature_calls = 0;
        self.episodes = Some(index);
        rows
    }

    pub fn load_episodes(
        &mut self,
        key_columns: EpisodeColumns,
        records: impl IntoIterator<Item = EpisodeRecord>,
    ) -> Result<usize, MatrixError> {
        let index = EpisodeIndex::from_records(key_columns, records)?;
        Ok(self.load_episode_index(index))
    }

    pub fn load_episode_list(
        &mut self,
        key_columns: EpisodeColumns,
        episodes: impl IntoIterator<Item = Episode>,
    ) -> usize {
        self.load_episode_index(EpisodeIndex::from_episodes(key_columns, episodes))
    }

    pub fn load_episodes_tsv(
        &mut self,
        path: &Path,
        key_columns: EpisodeColumns,
    ) -> Result<usize, MatrixError> {
        let records = read_episodes_tsv(path, &key_columns)?;
        self.load_episodes(key_columns, records)
    }

    fn require_episodes(&self) -> Result<&EpisodeIndex, MatrixError> {
        self.episodes.as_ref().ok_or_else(|| {
            MatrixError::Configuration("must process patients before feature".to_string())
        })
    }

    fn events_for(&mut self, selector: EventSelector) -> Result<std::rc::Rc<EventStream>, MatrixError> {
        let patient_ids = self.require_episodes()?.all_patient_ids();
        let key = CacheKey {
            source: self.source.label().to_string(),
            selector,
        };
        let source = self.source.as_ref();
        let sentinel = self.config.sentinel_result_value;
        let selector = key.selector.clone();
        let stream = self.cache.get_or_try_insert(key, || {
            fetch_event_stream(source, &selector, &patient_ids, sentinel).map_err(MatrixError::from)
        })?;
        Ok(stream)
    }

    fn index_mut(&mut self) -> Result<&mut EpisodeIndex, MatrixError> {
        self.episodes.as_mut().ok_or_else(|| {
            MatrixError::Configuration("must process patients before feature".to_string())
        })
    }

    fn add_windowed(
        &mut self,
        feature: &'static str,
        selector: EventSelector,
        base_names: Vec<String>,
        window: Window,
    ) -> Result<(), MatrixError> {
        self.require_episodes()?;
        if base_names.is_empty() {
            return Err(MatrixError::InvalidRequest(format!(
                "{feature} features need at least one name"
            )));
        }
        info!(
            component = "factory",
            event = "matrix.feature.start",
            feature,
            names = ?base_names,
            window = %window.label()
        );

        let stream = self.events_for(selector)?;
        let aggregator = WindowedAggregator::new(base_names, window);
        aggregator.apply(self.index_mut()?, &stream)?;
        self.finish_feature(feature);
        Ok(())
    }

    fn add_day_binned(
        &mut self,
        feature: &'static str,
        selector: EventSelector,
        label: String,
        day_bins: Option<Vec<u32>>,
        side: FeatureSide,
    ) -> Result<(), MatrixError> {
        self.require_episodes()?;
        let day_bins = day_bins.unwrap_or_else(|| self.config.default_day_bins.clone());
        info!(
            component = "factory",
            event = "matrix.feature.start",
            feature,
            label = %label,
            day_bins = ?day_bins,
            side = ?side
        );

        let stream = self.events_for(selector)?;
        let counter = DayBinCounter::new(label, day_bins, side);
        counter.apply(self.index_mut()?, &stream)?;
        self.finish_feature(feature);
        Ok(())
    }

    fn finish_feature(&mut self, feature: &'static str) {
        self.feature_calls += 1;
        let columns = self
            .episodes
            .as_ref()
            .map_or(0, |index| index.feature_columns().len());
        info!(
            component = "factory",
            event = "matrix.feature.finish",
            feature,
            total_feature_columns = columns,
            feature_calls = self.feature_calls
        );
    }

    pub fn add_lab_result_features(
        &mut self,
        names: &[String],
        by_panel: bool,
        window: Window,
    ) -> Result<(), MatrixError> {
        let selector = EventSelector::LabResults {
            names: names.to_vec(),
            by_panel,
        };
        self.add_windowed("lab_results", selector, names.to_vec(), window)
    }

    pub fn add_flowsheet_features(
        &mut self,
        names: &[String],
        window: Window,
    ) -> Result<(), MatrixError> {
        let selector = EventSelector::Flowsheets {
            names: names.to_vec(),
        };
        self.add_windowed("flowsheets", selector, names.to_vec(), window)
    }

    pub fn add_clinical_item_features(
        &mut self,
        patterns: &[String],
        column: ItemColumn,
        day_bins: Option<Vec<u32>>,
        label: Option<&str>,
        side: FeatureSide,
    ) -> Result<(), MatrixError> {
        if patterns.is_empty() {
            return Err(MatrixError::InvalidRequest(
                "clinical item features need at least one pattern".to_string(),
            ));
        }
        let selector = EventSelector::ClinicalItems {
            patterns: patterns.to_vec(),
            column,
        };
        let label = item_label(patterns, label);
        self.add_day_binned("clinical_items", selector, label, day_bins, side)
    }

    pub fn add_clinical_item_features_by_category(
        &mut self,
        category_ids: &[i64],
        label: Option<&str>,
        day_bins: Option<Vec<u32>>,
        side: FeatureSide,
    ) -> Result<(), MatrixError> {
        if category_ids.is_empty() {
            return Err(MatrixError::InvalidRequest(
                "category features need at least one category id".to_string(),
            ));
        }
        let selector = EventSelector::ClinicalItemCategories {
            category_ids: category_ids.to_vec(),
        };
        let ids: Vec<String> = category_ids.iter().map(i64::to_string).collect();
        let label = item_label(&ids, label);
        self.add_day_binned("clinical_item_categories", selector, label, day_bins, side)
    }

    pub fn add_time_cycle_features(&mut self, attribute: TimeAttribute) -> Result<(), MatrixError> {
        apply_time_cycle(self.index_mut()?, attribute)?;
        self.finish_feature("time_cycle");
        Ok(())
    }

    pub fn add_sex_features(&mut self) -> Result<(), MatrixError> {
        for sex in SEX_FEATURES {
            self.add_clinical_item_features(
                &[sex.to_string()],
                ItemColumn::Name,
                Some(Vec::new()),
                None,
                FeatureSide::Pre,
            )?;
        }
        Ok(())
    }

    pub fn add_race_features(&mut self, races: &[String]) -> Result<(), MatrixError> {
        for race in races {
            self.add_clinical_item_features(
                std::slice::from_ref(race),
                ItemColumn::Name,
                Some(Vec::new()),
                None,
                FeatureSide::Pre,
            )?;
        }
        Ok(())
    }

    pub fn add_grouped_item_features(
        &mut self,
        groups: &ItemGroups,
        prefix: &str,
        column: ItemColumn,
        side: FeatureSide,
    ) -> Result<(), MatrixError> {
        for group in groups.iter() {
            let label = format!("{prefix}.{}", group.label());
            self.add_clinical_item_features(&group.patterns, column, None, Some(&label), side)?;
        }
        Ok(())
    }

    pub fn build(&self) -> Result<FeatureMatrix, MatrixError> {
        let index = self.require_episodes()?;
        let matrix = FeatureMatrix::assemble(index);
        info!(
            component = "factory",
            event = "matrix.build.finish",
            rows = matrix.rows.len(),
            feature_columns = matrix.columns.len(),
            feature_calls = self.feature_calls,
            cache_hits = self.cache.hits(),
            cache_misses = self.cache.misses()
        );
        Ok(matrix)
    }
}
