//! Declarative build plans and item-group map files.
//!
//! A plan is a JSON document listing feature steps in the order they should
//! be added:
//!
//! ```json
//! {
//!   "steps": [
//!     { "kind": "lab_results", "names": ["NA", "K"], "window": { "pre": -30, "post": 0 } },
//!     { "kind": "clinical_items", "patterns": ["AdmitDxDate"], "day_bins": [1, 7, 30] },
//!     { "kind": "time_cycle", "attribute": "month" },
//!     { "kind": "sex" }
//!   ]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::day_bins::FeatureSide;
use crate::events::{DataSourceError, ItemColumn};
use crate::factory::{FeatureMatrixFactory, DEFAULT_RACE_FEATURES};
use crate::matrix::MatrixError;
use crate::time_cycle::TimeAttribute;
use crate::window::Window;

const GROUP_NAME_STRIP: &[char] = &[' ', '(', ')', '-', '/'];

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid plan: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("step {step} ({kind}): {source}")]
    Step {
        step: usize,
        kind: &'static str,
        #[source]
        source: MatrixError,
    },
    #[error("failed to load item groups for step {step}: {source}")]
    Groups {
        step: usize,
        #[source]
        source: DataSourceError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowUnit {
    #[default]
    Days,
    Hours,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowSpec {
    #[serde(default)]
    pub pre: Option<i64>,
    #[serde(default)]
    pub post: Option<i64>,
    #[serde(default)]
    pub unit: WindowUnit,
}

impl WindowSpec {
    pub fn to_window(self) -> Result<Window, MatrixError> {
        let delta = |amount: Option<i64>| -> Result<Option<TimeDelta>, MatrixError> {
            let Some(amount) = amount else {
                return Ok(None);
            };
            let delta = match self.unit {
                WindowUnit::Days => TimeDelta::try_days(amount),
                WindowUnit::Hours => TimeDelta::try_hours(amount),
            };
            delta.map(Some).ok_or_else(|| {
                MatrixError::InvalidRequest(format!(
                    "window offset {amount} {:?} is out of range",
                    self.unit
                ))
            })
        };
        Ok(Window::new(delta(self.pre)?, delta(self.post)?))
    }
}

fn default_races() -> Vec<String> {
    DEFAULT_RACE_FEATURES.iter().map(|race| race.to_string()).collect()
}

fn default_item_column() -> ItemColumn {
    ItemColumn::Name
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureStep {
    LabResults {
        names: Vec<String>,
        #[serde(default)]
        by_panel: bool,
        #[serde(default)]
        window: WindowSpec,
    },
    Flowsheets {
        names: Vec<String>,
        #[serde(default)]
        window: WindowSpec,
    },
    ClinicalItems {
        patterns: Vec<String>,
        #[serde(default = "default_item_column")]
        column: ItemColumn,
        #[serde(default)]
        day_bins: Option<Vec<u32>>,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        side: FeatureSide,
    },
    ClinicalItemCategories {
        category_ids: Vec<i64>,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        day_bins: Option<Vec<u32>>,
        #[serde(default)]
        side: FeatureSide,
    },
    TimeCycle {
        attribute: TimeAttribute,
    },
    Sex,
    Races {
        #[serde(default)]
        races: Option<Vec<String>>,
    },
    ItemGroups {
        map_path: PathBuf,
        group_column: String,
        item_column: String,
        prefix: String,
        // `{}` is replaced by each mapped item, e.g. `"ICD9.{}%"`.
        #[serde(default)]
        pattern_template: Option<String>,
        #[serde(default = "default_item_column")]
        column: ItemColumn,
        #[serde(default)]
        side: FeatureSide,
    },
}

impl FeatureStep {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LabResults { .. } => "lab_results",
            Self::Flowsheets { .. } => "flowsheets",
            Self::ClinicalItems { .. } => "clinical_items",
            Self::ClinicalItemCategories { .. } => "clinical_item_categories",
            Self::TimeCycle { .. } => "time_cycle",
            Self::Sex => "sex",
            Self::Races { .. } => "races",
            Self::ItemGroups { .. } => "item_groups",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeaturePlan {
    pub steps: Vec<FeatureStep>,
}

impl FeaturePlan {
    pub fn from_json_str(raw: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let raw = fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn apply(&self, factory: &mut FeatureMatrixFactory, base_dir: &Path) -> Result<(), PlanError> {
        for (step, feature) in self.steps.iter().enumerate() {
            apply_step(factory, feature, step, base_dir)?;
        }
        info!(
            component = "plan",
            event = "plan.apply.finish",
            steps = self.steps.len()
        );
        Ok(())
    }
}

fn apply_step(
    factory: &mut FeatureMatrixFactory,
    feature: &FeatureStep,
    step: usize,
    base_dir: &Path,
) -> Result<(), PlanError> {
    let result = match feature {
        FeatureStep::LabResults {
            names,
            by_panel,
            window,
        } => window
            .to_window()
            .and_then(|window| factory.add_lab_result_features(names, *by_panel, window)),
        FeatureStep::Flowsheets { names, window } => window
            .to_window()
            .and_then(|window| factory.add_flowsheet_features(names, window)),
        FeatureStep::ClinicalItems {
            patterns,
            column,
            day_bins,
            label,
            side,
        } => factory.add_clinical_item_features(
            patterns,
            *column,
            day_bins.clone(),
            label.as_deref(),
            *side,
        ),
        FeatureStep::ClinicalItemCategories {
            category_ids,
            label,
            day_bins,
            side,
        } => factory.add_clinical_item_features_by_category(
            category_ids,
            label.as_deref(),
            day_bins.clone(),
            *side,
        ),
        FeatureStep::TimeCycle { attribute } => factory.add_time_cycle_features(*attribute),
        FeatureStep::Sex => factory.add_sex_features(),
        FeatureStep::Races { races } => match races {
            Some(races) => factory.add_race_features(races),
            None => factory.add_race_features(&default_races()),
        },
        FeatureStep::ItemGroups {
            map_path,
            group_column,
            item_column,
            prefix,
            pattern_template,
            column,
            side,
        } => {
            let path = base_dir.join(map_path);
            let mut groups = load_item_groups_tsv(&path, group_column, item_column)
                .map_err(|source| PlanError::Groups { step, source })?;
            if let Some(template) = pattern_template {
                groups = groups.with_pattern_template(template);
            }
            factory.add_grouped_item_features(&groups, prefix, *column, *side)
        }
    };
    result.map_err(|source| PlanError::Step {
        step,
        kind: feature.kind(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemGroup {
    pub name: String,
    pub patterns: Vec<String>,
}

impl ItemGroup {
    pub fn label(&self) -> String {
        self.name.replace(GROUP_NAME_STRIP, "")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemGroups {
    groups: Vec<ItemGroup>,
}

impl ItemGroups {
    pub fn push(&mut self, name: &str, pattern: impl Into<String>) {
        let pattern = pattern.into();
        match self.groups.iter_mut().find(|group| group.name == name) {
            Some(group) => group.patterns.push(pattern),
            None => self.groups.push(ItemGroup {
                name: name.to_string(),
                patterns: vec![pattern],
            }),
        }
    }

    pub fn with_pattern_template(mut self, template: &str) -> Self {
        for group in &mut self.groups {
            for pattern in &mut group.patterns {
                *pattern = template.replace("{}", pattern.as_str());
            }
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemGroup> {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

pub fn load_item_groups_tsv(
    path: &Path,
    group_column: &str,
    item_column: &str,
) -> Result<ItemGroups, DataSourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| DataSourceError::MalformedRecord {
                line: 1,
                reason: format!("missing column '{name}'"),
            })
    };
    let group_idx = position(group_column)?;
    let item_idx = position(item_column)?;

    let mut groups = ItemGroups::default();
    for record in reader.records() {
        let record = record?;
        let (Some(group), Some(item)) = (record.get(group_idx), record.get(item_idx)) else {
            continue;
        };
        let (group, item) = (group.trim(), item.trim());
        if group.is_empty() || item.is_empty() {
            continue;
        }
        groups.push(group, item);
    }

    info!(
        component = "plan",
        event = "plan.groups.loaded",
        path = %path.display(),
        groups = groups.len()
    );
    Ok(groups)
}
