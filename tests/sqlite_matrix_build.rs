use std::fs;
use std::path::Path;

use featmat::{
    BuildConfig, EpisodeColumns, FeatureMatrixFactory, FeaturePlan, FeatureSide, FeatureValue,
    ItemColumn, PlanError, SqliteEventSource,
};
use rusqlite::{params, Connection};
use tempfile::TempDir;

fn seed_store(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("events.sqlite");
    let conn = Connection::open(&path).expect("create store");
    conn.execute_batch(
        "
        CREATE TABLE lab_results (
            pat_id INTEGER, proc_code TEXT, base_name TEXT,
            ord_num_value, result_in_range_yn TEXT, result_time TEXT
        );
        CREATE TABLE flowsheet (
            pat_id INTEGER, flowsheet_name TEXT, flowsheet_value, shifted_dt_tm TEXT
        );
        CREATE TABLE clinical_item (
            clinical_item_id INTEGER, clinical_item_category_id INTEGER,
            name TEXT, description TEXT
        );
        CREATE TABLE patient_item (
            patient_id INTEGER, clinical_item_id INTEGER, item_date TEXT
        );
        ",
    )
    .expect("schema");

    let labs: [(i64, &str, f64, &str, &str); 5] = [
        (1, "WBC", 8.0, "Y", "2020-01-02 06:00:00"),
        (1, "WBC", 12.0, "N", "2020-01-04 06:00:00"),
        (1, "WBC", 10.0, "Y", "2020-01-05 06:00:00"),
        (2, "WBC", 6.5, "Y", "2020-03-01 08:00:00"),
        (2, "WBC", 9_999_999.0, "N", "2020-03-01 09:00:00"),
    ];
    for (pat_id, base_name, value, in_range, at) in labs {
        conn.execute(
            "INSERT INTO lab_results VALUES (?1, 'LABCBC', ?2, ?3, ?4, ?5)",
            params![pat_id, base_name, value, in_range, at],
        )
        .expect("insert lab");
    }

    conn.execute(
        "INSERT INTO flowsheet VALUES (1, 'Pulse', '88', '2020-01-05 20:00:00')",
        [],
    )
    .expect("insert flowsheet");

    conn.execute_batch(
        "
        INSERT INTO clinical_item VALUES (1, 1, 'Male', 'Male');
        INSERT INTO clinical_item VALUES (2, 1, 'Female', 'Female');
        INSERT INTO clinical_item VALUES (3, 2, 'ICD9.250.00', 'Diabetes');
        INSERT INTO clinical_item VALUES (4, 3, 'Death', 'Death');
        INSERT INTO patient_item VALUES (1, 1, '2000-01-01');
        INSERT INTO patient_item VALUES (2, 2, '2000-01-01');
        INSERT INTO patient_item VALUES (1, 3, '2019-12-20');
        INSERT INTO patient_item VALUES (2, 4, '2020-03-20');
        ",
    )
    .expect("insert items");
    path
}

fn write_inputs(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let episodes = dir.join("episodes.tsv");
    fs::write(
        &episodes,
        "# cohort extract\n\
         pat_id\tadmit_time\tward\n\
         1\t2020-01-06 00:00:00\tICU\n\
         2\t2020-03-02 12:00:00\tMED\n\
         4\t2020-05-01 00:00:00\tMED\n",
    )
    .expect("write episodes");

    fs::write(
        dir.join("comorbidity.tsv"),
        "charlson\ticd9cm\nDiabetes\t250\nDiabetes\t249\nRenal Disease\t585\n",
    )
    .expect("write comorbidity map");

    let plan = dir.join("plan.json");
    fs::write(
        &plan,
        r#"{
          "steps": [
            {"kind": "lab_results", "names": ["WBC"], "window": {"pre": -7, "post": 0}},
            {"kind": "flowsheets", "names": ["Pulse"], "window": {"pre": -12, "post": 0, "unit": "hours"}},
            {"kind": "sex"},
            {"kind": "clinical_items", "patterns": ["Death"], "day_bins": [30], "side": "post"},
            {"kind": "item_groups", "map_path": "comorbidity.tsv", "group_column": "charlson",
             "item_column": "icd9cm", "prefix": "Comorbidity", "pattern_template": "ICD9.{}%",
             "side": "pre"},
            {"kind": "time_cycle", "attribute": "month"}
          ]
        }"#,
    )
    .expect("write plan");
    (episodes, plan)
}

fn key_columns() -> EpisodeColumns {
    EpisodeColumns {
        patient_id: "pat_id".to_string(),
        index_time: "admit_time".to_string(),
    }
}

fn build_tsv(dir: &Path) -> Vec<u8> {
    let store = dir.join("events.sqlite");
    let (episodes, plan_path) = (dir.join("episodes.tsv"), dir.join("plan.json"));

    let source = SqliteEventSource::open(&store).expect("open store");
    let mut factory = FeatureMatrixFactory::new(Box::new(source), BuildConfig::default());
    factory
        .load_episodes_tsv(&episodes, key_columns())
        .expect("episodes load");
    FeaturePlan::load(&plan_path)
        .expect("plan parses")
        .apply(&mut factory, dir)
        .expect("plan applies");

    let matrix = factory.build().expect("matrix builds");
    let mut out = Vec::new();
    matrix
        .write_tsv(&mut out, &["matrix.tsv".to_string()])
        .expect("tsv writes");
    out
}

#[test]
fn plan_builds_matrix_from_sqlite_store() {
    let dir = TempDir::new().expect("tempdir");
    let store = seed_store(dir.path());
    let (episodes, plan_path) = write_inputs(dir.path());

    let source = SqliteEventSource::open(&store).expect("open store");
    let mut factory = FeatureMatrixFactory::new(Box::new(source), BuildConfig::default());
    assert_eq!(
        factory
            .load_episodes_tsv(&episodes, key_columns())
            .expect("episodes load"),
        3
    );
    FeaturePlan::load(&plan_path)
        .expect("plan parses")
        .apply(&mut factory, dir.path())
        .expect("plan applies");
    let matrix = factory.build().expect("matrix builds");

    assert_eq!(matrix.rows.len(), 3);
    assert_eq!(&matrix.header()[..2], &["pat_id", "admit_time"]);

    // patient 1: three WBC results in the week before admission
    assert_eq!(matrix.value(0, "WBC.-7_0.count"), Some(FeatureValue::Count(3)));
    assert_eq!(matrix.value(0, "WBC.-7_0.countInRange"), Some(FeatureValue::Count(2)));
    assert_eq!(matrix.value(0, "WBC.-7_0.median"), Some(FeatureValue::Real(10.0)));
    assert_eq!(matrix.value(0, "WBC.-7_0.mean"), Some(FeatureValue::Real(10.0)));
    assert_eq!(matrix.value(0, "WBC.-7_0.diff"), Some(FeatureValue::Real(2.0)));
    assert_eq!(matrix.value(0, "WBC.-7_0.slope"), Some(FeatureValue::Real(2.0 / 3.0)));
    assert_eq!(matrix.value(0, "WBC.-7_0.proximate"), Some(FeatureValue::Real(10.0)));
    assert_eq!(matrix.value(0, "Pulse.-1_0.count"), Some(FeatureValue::Count(1)));
    assert_eq!(matrix.value(0, "Male.pre"), Some(FeatureValue::Count(1)));
    assert_eq!(matrix.value(0, "Comorbidity.Diabetes.pre"), Some(FeatureValue::Count(1)));
    assert_eq!(
        matrix.value(0, "Comorbidity.RenalDisease.pre"),
        Some(FeatureValue::Count(0))
    );
    assert_eq!(matrix.value(0, "admit_time.month"), Some(FeatureValue::Count(1)));

    // patient 2: sentinel result dropped, death within 30 days after
    assert_eq!(matrix.value(1, "WBC.-7_0.count"), Some(FeatureValue::Count(1)));
    assert_eq!(matrix.value(1, "WBC.-7_0.max"), Some(FeatureValue::Real(6.5)));
    assert_eq!(matrix.value(1, "Female.pre"), Some(FeatureValue::Count(1)));
    assert_eq!(matrix.value(1, "Death.post_30d"), Some(FeatureValue::Count(1)));
    assert_eq!(matrix.value(1, "Death.postTimeDays"), Some(FeatureValue::Real(17.5)));

    // patient 4 has no events at all but still gets a row
    assert_eq!(matrix.rows[2].episode.patient_id, 4);
    assert_eq!(matrix.value(2, "WBC.-7_0.count"), Some(FeatureValue::Count(0)));
    assert_eq!(matrix.value(2, "WBC.-7_0.mean"), Some(FeatureValue::Missing));
    assert_eq!(matrix.value(2, "Death.post"), Some(FeatureValue::Count(0)));
    assert_eq!(matrix.value(2, "admit_time.month"), Some(FeatureValue::Count(5)));
}

#[test]
fn tsv_output_is_byte_identical_across_builds() {
    let dir = TempDir::new().expect("tempdir");
    seed_store(dir.path());
    write_inputs(dir.path());

    let first = build_tsv(dir.path());
    let second = build_tsv(dir.path());
    assert_eq!(first, second);

    let text = String::from_utf8(first).expect("utf8 output");
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("# matrix.tsv"));
    let header = lines.next().expect("header row");
    assert!(header.starts_with("pat_id\tadmit_time\tWBC.-7_0.count\tWBC.-7_0.countInRange\t"));

    let last_row = lines.last().expect("data rows");
    let fields: Vec<&str> = last_row.split('\t').collect();
    assert_eq!(fields[0], "4");
    assert_eq!(fields[1], "2020-05-01 00:00:00");
    assert_eq!(fields[2], "0");
    assert_eq!(fields[4], "None");
    assert_eq!(fields.len(), header.split('\t').count());
}

#[test]
fn failing_plan_step_reports_its_position() {
    let dir = TempDir::new().expect("tempdir");
    let store = seed_store(dir.path());
    let (episodes, _) = write_inputs(dir.path());

    let source = SqliteEventSource::open(&store).expect("open store");
    let mut factory = FeatureMatrixFactory::new(Box::new(source), BuildConfig::default());
    factory
        .load_episodes_tsv(&episodes, key_columns())
        .expect("episodes load");

    let plan = FeaturePlan::from_json_str(
        r#"{"steps": [
            {"kind": "sex"},
            {"kind": "clinical_items", "patterns": ["Male"], "day_bins": [], "side": "pre"}
        ]}"#,
    )
    .expect("plan parses");
    let err = plan.apply(&mut factory, dir.path()).expect_err("duplicate columns");
    assert!(matches!(
        err,
        PlanError::Step {
            step: 1,
            kind: "clinical_items",
            ..
        }
    ));
}

#[test]
fn missing_store_is_reported_as_unavailable() {
    let dir = TempDir::new().expect("tempdir");
    let err = SqliteEventSource::open(&dir.path().join("absent.sqlite"))
        .err()
        .expect("open fails");
    assert!(err.to_string().contains("unavailable"));
}

#[test]
fn wide_item_patterns_match_more_items_than_sqlite_variables() {
    let dir = TempDir::new().expect("tempdir");
    let store = seed_store(dir.path());
    let (episodes, _) = write_inputs(dir.path());

    let conn = Connection::open(&store).expect("reopen store");
    conn.execute_batch(
        "
        WITH RECURSIVE seq(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM seq WHERE x < 33000)
        INSERT INTO clinical_item
            SELECT 100000 + x, 5, 'ICD10.X' || x, 'diagnosis ' || x FROM seq;
        INSERT INTO patient_item VALUES (1, 132999, '2019-12-01');
        INSERT INTO patient_item VALUES (4, 100001, '2020-06-01');
        ",
    )
    .expect("seed wide catalog");
    drop(conn);

    let source = SqliteEventSource::open(&store).expect("open store");
    let mut factory = FeatureMatrixFactory::new(Box::new(source), BuildConfig::default());
    factory
        .load_episodes_tsv(&episodes, key_columns())
        .expect("episodes load");
    factory
        .add_clinical_item_features(
            &["ICD10.%".to_string()],
            ItemColumn::Name,
            Some(vec![30]),
            Some("Dx"),
            FeatureSide::Pre,
        )
        .expect("wide pattern is valid input");
    factory
        .add_clinical_item_features_by_category(&[5], Some("DxCategory"), Some(vec![]), FeatureSide::All)
        .expect("wide category is valid input");
    let matrix = factory.build().expect("matrix builds");

    assert_eq!(matrix.value(0, "Dx.pre"), Some(FeatureValue::Count(1)));
    assert_eq!(matrix.value(0, "Dx.pre_30d"), Some(FeatureValue::Count(0)));
    assert_eq!(matrix.value(1, "Dx.pre"), Some(FeatureValue::Count(0)));
    assert_eq!(matrix.value(2, "DxCategory.post"), Some(FeatureValue::Count(1)));
    assert_eq!(matrix.value(2, "DxCategory.pre"), Some(FeatureValue::Count(0)));
}
