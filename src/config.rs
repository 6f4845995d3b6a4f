//! Build configuration and environment parsing.

use std::env;

use crate::day_bins::DEFAULT_DAY_BINS;
use crate::events::DEFAULT_SENTINEL_RESULT_VALUE;

#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    pub sentinel_result_value: f64,
    pub default_day_bins: Vec<u32>,
    pub cache_events: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            sentinel_result_value: DEFAULT_SENTINEL_RESULT_VALUE,
            default_day_bins: DEFAULT_DAY_BINS.to_vec(),
            cache_events: true,
        }
    }
}

pub fn build_config_from_env() -> BuildConfig {
    let mut config = BuildConfig::default();

    if let Ok(raw) = env::var("FEATMAT_SENTINEL") {
        if let Ok(value) = raw.trim().parse::<f64>() {
            if value.is_finite() {
                config.sentinel_result_value = value;
            }
        }
    }

    if let Ok(raw) = env::var("FEATMAT_DAY_BINS") {
        if let Some(bins) = parse_day_bins(&raw) {
            config.default_day_bins = bins;
        }
    }

    if let Ok(raw) = env::var("FEATMAT_CACHE") {
        if let Some(enabled) = parse_bool(&raw) {
            config.cache_events = enabled;
        }
    }

    config
}

pub fn parse_day_bins(raw: &str) -> Option<Vec<u32>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    trimmed
        .split(',')
        .map(|part| part.trim().parse::<u32>().ok())
        .collect()
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_env::with_env_vars;
    use super::*;

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(
            &[
                ("FEATMAT_SENTINEL", None),
                ("FEATMAT_DAY_BINS", None),
                ("FEATMAT_CACHE", None),
            ],
            build_config_from_env,
        );
        assert_eq!(cfg, BuildConfig::default());
        assert_eq!(cfg.default_day_bins.len(), 11);
    }

    #[test]
    fn reads_overrides_from_env() {
        let cfg = with_env_vars(
            &[
                ("FEATMAT_SENTINEL", Some("500")),
                ("FEATMAT_DAY_BINS", Some("1, 7,30")),
                ("FEATMAT_CACHE", Some("off")),
            ],
            build_config_from_env,
        );
        assert_eq!(cfg.sentinel_result_value, 500.0);
        assert_eq!(cfg.default_day_bins, vec![1, 7, 30]);
        assert!(!cfg.cache_events);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let cfg = with_env_vars(
            &[
                ("FEATMAT_SENTINEL", Some("lots")),
                ("FEATMAT_DAY_BINS", Some("1,-7")),
                ("FEATMAT_CACHE", Some("maybe")),
            ],
            build_config_from_env,
        );
        assert_eq!(cfg, BuildConfig::default());
    }
}
