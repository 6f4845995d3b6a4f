use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::Utc;
use featmat::{
    build_config_from_env, init_logging, log_build_start, log_inputs_selected,
    log_matrix_written, logging_config_from_env, EpisodeColumns, FeatureMatrixFactory,
    FeaturePlan, SqliteEventSource,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let build_cfg = build_config_from_env();
    log_build_start(&logging_cfg, &build_cfg);

    let episodes_path = required_path("FEATMAT_EPISODES_PATH")?;
    let store_path = required_path("FEATMAT_STORE_PATH")?;
    let plan_path = std::env::var("FEATMAT_PLAN_PATH").ok().map(PathBuf::from);
    let output_path = std::env::var("FEATMAT_OUTPUT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("feature_matrix.tsv"));
    log_inputs_selected(&episodes_path, &store_path, plan_path.as_deref());

    let source = SqliteEventSource::open(&store_path)?;
    let mut factory = FeatureMatrixFactory::new(Box::new(source), build_cfg);
    factory.load_episodes_tsv(&episodes_path, episode_columns_from_env())?;

    if let Some(plan_path) = &plan_path {
        let plan = FeaturePlan::load(plan_path)?;
        let base_dir = plan_path.parent().unwrap_or_else(|| Path::new("."));
        plan.apply(&mut factory, base_dir)?;
    }

    let matrix = factory.build()?;
    let file_name = output_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| output_path.display().to_string());
    let comments = vec![
        file_name,
        format!("Created: {}", Utc::now().format("%Y-%m-%d %H:%M:%S")),
    ];
    let out = BufWriter::new(File::create(&output_path)?);
    matrix.write_tsv(out, &comments)?;

    log_matrix_written(
        &output_path,
        matrix.rows.len(),
        matrix.columns.len(),
        &matrix.schema_fingerprint(),
    );
    Ok(())
}

fn required_path(var: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => Ok(PathBuf::from(raw.trim())),
        _ => Err(format!("{var} must point to an existing file").into()),
    }
}

fn episode_columns_from_env() -> EpisodeColumns {
    let mut columns = EpisodeColumns::default();
    if let Ok(raw) = std::env::var("FEATMAT_PATIENT_ID_COLUMN") {
        if !raw.trim().is_empty() {
            columns.patient_id = raw.trim().to_string();
        }
    }
    if let Ok(raw) = std::env::var("FEATMAT_INDEX_TIME_COLUMN") {
        if !raw.trim().is_empty() {
            columns.index_time = raw.trim().to_string();
        }
    }
    columns
}
