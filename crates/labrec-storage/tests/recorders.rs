use labrec_core::{
    value_map, Category, CategoryTableBuilder, CellValue, GroupTables, IndexAllocator,
    TableMerger, ValueMap,
};
use labrec_storage::{
    ArchiveSession, Capability, CsvRecorder, ParquetRecorder, Recorder, RecorderConfig,
    RecorderError, RecorderKind, SqliteRecorder,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

fn heater_params(voltage: f64, sample_time: i64) -> ValueMap {
    value_map([
        ("voltage", CellValue::Float(voltage)),
        ("sample_time", CellValue::Int(sample_time)),
        ("sample_rate", CellValue::Int(1)),
    ])
}

fn station_metadata() -> ValueMap {
    value_map([("operator", "kim"), ("sensor", "pt100")])
}

fn sample(step: i64) -> ValueMap {
    value_map([
        ("power", CellValue::Float(0.25 + step as f64)),
        ("time", CellValue::Int(step)),
    ])
}

fn scenario_a(session: &mut ArchiveSession) {
    session
        .begin_record(&heater_params(5.0, 10), &station_metadata())
        .expect("begin record");
    for step in 0..10 {
        session.add_sample(&sample(step)).expect("add sample");
    }
}

/// Heater sweep returning to its starting setpoint, two samples per step.
fn scenario_b(session: &mut ArchiveSession) {
    for voltage in [0.0, 2.0, 4.0, 6.0, 0.0] {
        session
            .begin_record(&heater_params(voltage, 2), &station_metadata())
            .expect("begin record");
        for step in 0..2 {
            session.add_sample(&sample(step)).expect("add sample");
        }
    }
}

fn read_merged(kind: RecorderKind, path: &Path) -> labrec_core::MergedTable {
    match kind {
        RecorderKind::Csv => CsvRecorder::read_merged(path).expect("read csv"),
        RecorderKind::Sqlite => SqliteRecorder::read_merged(path).expect("read sqlite"),
        RecorderKind::Parquet => {
            let groups = ParquetRecorder::read_container(path).expect("read container");
            let mut rows = Vec::new();
            let mut schema = None;
            for group in &groups {
                let merged = TableMerger::merge_group(group).expect("merge group");
                schema.get_or_insert(merged.schema.clone());
                rows.extend(merged.rows);
            }
            labrec_core::MergedTable {
                schema: schema.expect("at least one group"),
                rows,
            }
        }
    }
}

const ALL_KINDS: [RecorderKind; 3] = [
    RecorderKind::Csv,
    RecorderKind::Sqlite,
    RecorderKind::Parquet,
];

#[test]
fn merged_scenario_a_reads_back_from_every_target() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RecorderConfig::new(kind, dir.path().join("heater"));
        let path = config.path.clone();

        let mut session = ArchiveSession::open(config).expect("open session");
        assert_eq!(session.resume_point().last_group, None);
        scenario_a(&mut session);
        let report = session.end_group().expect("write group");
        assert_eq!(report.group, 0);
        assert_eq!(report.rows_written, 10);
        assert!(!report.skipped);
        session.close().expect("close");

        let merged = read_merged(kind, &path);
        assert_eq!(merged.len(), 10, "{kind}");
        assert_eq!(
            merged.columns(),
            vec![
                "RecordGroup",
                "RecordGroupInd",
                "RecordRow",
                "power",
                "time",
                "proc.sample_rate",
                "proc.sample_time",
                "proc.voltage",
                "meta.operator",
                "meta.sensor",
            ],
            "{kind}"
        );
        for (position, row) in merged.rows.iter().enumerate() {
            assert_eq!((row.index.group, row.index.group_ind), (0, 0), "{kind}");
            assert_eq!(row.index.row, position as u64, "{kind}");
            assert_eq!(
                merged.value(position, "power"),
                Some(&CellValue::Float(0.25 + position as f64)),
                "{kind}"
            );
            assert_eq!(
                merged.value(position, "proc.voltage"),
                Some(&CellValue::Float(5.0))
            );
            assert_eq!(
                merged.value(position, "meta.operator"),
                Some(&CellValue::from("kim"))
            );
        }
    }
}

#[test]
fn non_merging_scenario_b_keeps_sections_apart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RecorderConfig::new(RecorderKind::Parquet, dir.path().join("sweep"));
    let path = config.path.clone();

    let mut session = ArchiveSession::open(config).expect("open session");
    assert_eq!(session.recorder().capability(), Capability::NonMerging);
    scenario_a(&mut session);
    session.end_group().expect("write group 0");
    scenario_b(&mut session);
    let report = session.end_group().expect("write group 1");
    assert_eq!(report.group, 1);
    session.close().expect("close");

    for section in ["data", "proc_params", "metadata"] {
        assert!(path.join(section).join("group-00000001.parquet").is_file());
    }
    let groups = ParquetRecorder::read_container(&path).expect("read container");
    assert_eq!(groups.len(), 2);
    let group_b = &groups[1];
    assert_eq!(group_b.group, 1);
    assert_eq!(group_b.data.len(), 10);
    assert_eq!(group_b.params.len(), 5);
    assert_eq!(group_b.metadata.len(), 5);
    let keys = group_b
        .params
        .rows
        .iter()
        .map(|row| (row.group, row.group_ind))
        .collect::<Vec<_>>();
    assert_eq!(keys, (0..5).map(|ind| (1, ind)).collect::<Vec<_>>());
    let voltages = group_b
        .params
        .column_values("voltage")
        .into_iter()
        .filter_map(CellValue::as_f64)
        .collect::<Vec<_>>();
    assert_eq!(voltages, vec![0.0, 2.0, 4.0, 6.0, 0.0]);
    assert_eq!(group_b.params.row_map(0), group_b.params.row_map(4));
    for section in [&group_b.data, &group_b.metadata] {
        let inds = section
            .rows
            .iter()
            .map(|row| row.group_ind)
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(inds.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }
    assert_eq!(group_b.data.rows[9].row, Some(1));
    assert_eq!(group_b.data.rows[9].group_ind, 4);
}

#[test]
fn reopened_target_resumes_after_the_last_group() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RecorderConfig::new(kind, dir.path().join("resume"));

        let mut session = ArchiveSession::open(config.clone()).expect("open session");
        for _ in 0..3 {
            scenario_a(&mut session);
            session.end_group().expect("write group");
        }
        session.close().expect("close");

        let mut session = ArchiveSession::open(config.clone()).expect("reopen session");
        assert_eq!(session.resume_point().last_group, Some(2), "{kind}");
        assert!(!session.resume_point().recovered_partial);
        scenario_b(&mut session);
        let report = session.end_group().expect("append group");
        assert_eq!(report.group, 3, "{kind}");
        session.close().expect("close");

        let merged = read_merged(kind, &config.path);
        assert_eq!(merged.len(), 40, "{kind}");
        let groups = merged
            .rows
            .iter()
            .map(|row| row.index.group)
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(groups.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }
}

#[test]
fn schema_conflict_names_target_group_and_columns() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RecorderConfig::new(kind, dir.path().join("conflict"));

        let mut session = ArchiveSession::open(config.clone()).expect("open session");
        scenario_a(&mut session);
        session.end_group().expect("write group");
        session.close().expect("close");

        let mut session = ArchiveSession::open(config.clone()).expect("reopen session");
        let mut params = heater_params(5.0, 10);
        params.insert("current".to_string(), CellValue::Float(0.5));
        session
            .begin_record(&params, &station_metadata())
            .expect("new session establishes its own schema");
        session.add_sample(&sample(0)).expect("add sample");
        let err = session.end_group().expect_err("schema conflict");
        match err {
            RecorderError::SchemaConflict {
                target,
                group,
                category,
                diff,
            } => {
                assert_eq!(target, config.path, "{kind}");
                assert_eq!(group, 1, "{kind}");
                assert_eq!(category, Category::ProcParams, "{kind}");
                let unexpected = diff.unexpected.join(",");
                assert!(unexpected.ends_with("current"), "{kind}: {diff}");
                assert!(diff.missing.is_empty(), "{kind}: {diff}");
            }
            other => panic!("{kind}: unexpected error {other}"),
        }
        assert_eq!(session.abort_group(), Some(1));
        session.close().expect("close");

        let merged = read_merged(kind, &config.path);
        assert_eq!(merged.len(), 10, "{kind}: earlier group intact");
    }
}

#[test]
fn rewriting_a_persisted_group_is_skipped() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RecorderConfig::new(kind, dir.path().join("retry"));
        let path = config.path.clone();

        let mut builder = CategoryTableBuilder::new(IndexAllocator::new());
        builder
            .begin_record(&heater_params(5.0, 10), &station_metadata())
            .expect("begin record");
        builder.add_sample(&sample(0)).expect("add sample");
        let tables = builder.end_group().expect("end group");

        let mut recorder = Recorder::new(config);
        recorder.open().expect("open");
        assert!(!recorder.write(&tables).expect("first write").skipped);
        let again = recorder.write(&tables).expect("second write");
        assert!(again.skipped, "{kind}");
        assert_eq!(again.rows_written, 0);
        recorder.close().expect("close");

        assert_eq!(read_merged(kind, &path).len(), 1, "{kind}");
    }
}

#[test]
fn empty_group_still_consumes_its_number() {
    for kind in ALL_KINDS {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RecorderConfig::new(kind, dir.path().join("empty"));

        let mut session = ArchiveSession::open(config.clone()).expect("open session");
        session
            .begin_record(&heater_params(5.0, 10), &station_metadata())
            .expect("begin record without samples");
        let report = session.end_group().expect("write empty group");
        assert_eq!((report.group, report.rows_written), (0, 0));
        scenario_a(&mut session);
        assert_eq!(session.end_group().expect("write group").group, 1);
        session.close().expect("close");

        let session = ArchiveSession::open(config).expect("reopen");
        assert_eq!(session.resume_point().last_group, Some(1), "{kind}");
        session.close().expect("close");
    }
}

#[test]
fn second_recorder_cannot_open_a_locked_target() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RecorderConfig::new(RecorderKind::Sqlite, dir.path().join("shared"));

    let mut first = Recorder::new(config.clone());
    first.open().expect("first open");
    let mut second = Recorder::new(config.clone());
    assert!(matches!(second.open(), Err(RecorderError::Locked { .. })));

    first.close().expect("close first");
    let mut third = Recorder::new(config);
    third.open().expect("open after release");
}

#[test]
fn csv_discards_bytes_of_an_interrupted_group() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RecorderConfig::new(RecorderKind::Csv, dir.path().join("crash.csv"));

    let mut session = ArchiveSession::open(config.clone()).expect("open session");
    scenario_a(&mut session);
    session.end_group().expect("write group");
    session.close().expect("close");
    let committed_len = fs::metadata(&config.path).expect("metadata").len();

    let mut file = OpenOptions::new()
        .append(true)
        .open(&config.path)
        .expect("open target");
    file.write_all(b"1,0,0,9.5,0,1,10,5,ki")
        .expect("write torn row");
    drop(file);

    let mut session = ArchiveSession::open(config.clone()).expect("reopen session");
    let resume = session.resume_point();
    assert_eq!(resume.last_group, Some(0));
    assert!(resume.recovered_partial);
    assert_eq!(
        fs::metadata(&config.path).expect("metadata").len(),
        committed_len
    );

    scenario_a(&mut session);
    assert_eq!(session.end_group().expect("write group").group, 1);
    session.close().expect("close");
    assert_eq!(CsvRecorder::read_merged(&config.path).expect("read").len(), 20);
}

#[test]
fn container_drops_groups_missing_a_section() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RecorderConfig::new(RecorderKind::Parquet, dir.path().join("crash"));
    let path = config.path.clone();

    let mut session = ArchiveSession::open(config.clone()).expect("open session");
    scenario_a(&mut session);
    session.end_group().expect("write group 0");
    scenario_a(&mut session);
    session.end_group().expect("write group 1");
    session.close().expect("close");

    fs::remove_file(path.join("metadata").join("group-00000001.parquet"))
        .expect("simulate interrupted rename");
    fs::write(path.join("data").join("group-00000002.parquet.tmp"), b"partial")
        .expect("stray staged file");

    let session = ArchiveSession::open(config).expect("reopen session");
    let resume = session.resume_point();
    assert_eq!(resume.last_group, Some(0));
    assert!(resume.recovered_partial);
    session.close().expect("close");

    assert!(!path.join("data").join("group-00000001.parquet").exists());
    assert!(!path.join("data").join("group-00000002.parquet.tmp").exists());
    let groups = ParquetRecorder::read_container(&path).expect("read container");
    assert_eq!(groups.iter().map(|group| group.group).collect::<Vec<_>>(), vec![0]);
}

#[test]
fn container_rejects_values_of_another_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RecorderConfig::new(RecorderKind::Parquet, dir.path().join("types"));

    let mut session = ArchiveSession::open(config.clone()).expect("open session");
    scenario_a(&mut session);
    session.end_group().expect("write group");
    session
        .begin_record(&heater_params(5.0, 10), &station_metadata())
        .expect("begin record");
    session
        .add_sample(&value_map([
            ("power", CellValue::from("overload")),
            ("time", CellValue::Int(0)),
        ]))
        .expect("builder accepts any value type");
    let err = session.end_group().expect_err("type conflict");
    assert!(matches!(
        err,
        RecorderError::TypeConflict { ref column, .. } if column == "power"
    ));
    assert_eq!(session.abort_group(), Some(1));
    session.close().expect("close");
}

#[test]
fn config_file_selects_the_recorder() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("recorder.toml");
    let target = dir.path().join("from_config.sqlite");
    fs::write(
        &config_path,
        format!("kind = \"sqlite\"\npath = {:?}\n", target.display().to_string()),
    )
    .expect("write config");

    let config = RecorderConfig::load(&config_path).expect("load config");
    assert_eq!(config.kind, RecorderKind::Sqlite);
    let mut session = ArchiveSession::open(config).expect("open session");
    scenario_a(&mut session);
    session.end_group().expect("write group");
    session.close().expect("close");

    let tables: Vec<GroupTables> =
        TableMerger::split(&SqliteRecorder::read_merged(&target).expect("read"))
            .expect("split");
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].params.row_map(0), Some(heater_params(5.0, 10)));
}
