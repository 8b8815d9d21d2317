mod common;

use approx::assert_relative_eq;
use common::*;
use hypercal::core::{Admission, CalibrationRepository, JobDescriptor, JobState, Orchestrator, SkipReason};
use hypercal::io::{read_artifact, EnviCubeWriter, EnviRawSource, FsBundleStore};
use hypercal::types::{ErrorClass, SensorVariant, QA_SATURATED};
use std::fs::{self, File};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_raw_reader_directory_and_zip_agree() {
    let scratch = tempfile::tempdir().unwrap();
    let cube = synthetic_cube(4, 3, 5);
    let scan_dir = scratch.path().join("scan");
    write_raw_scan(&scan_dir, "VNIR_2017", &cube);

    let zip_path = scratch.path().join("scan.zip");
    let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
    for entry in fs::read_dir(&scan_dir).unwrap() {
        let entry = entry.unwrap();
        let name = format!("VNIR - 2017-04-27/{}", entry.file_name().to_string_lossy());
        writer
            .start_file(name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(&fs::read(entry.path()).unwrap()).unwrap();
    }
    writer.finish().unwrap();

    let source = EnviRawSource::new(Duration::from_secs(5));
    let variant = SensorVariant::new("vnir");
    let from_dir = source.read(scan_dir.to_str().unwrap(), &variant, ts(2017, 4, 27)).unwrap();
    let from_zip = source.read(zip_path.to_str().unwrap(), &variant, ts(2017, 4, 27)).unwrap();

    assert_eq!(from_dir.cube, cube);
    assert_eq!(from_zip.cube, cube);
    assert_eq!(from_dir.instrument.saturation_value, 4095);
    assert_eq!(from_zip.instrument.integration_time_ms, Some(20.0));
    assert!(source.has_required_files(zip_path.to_str().unwrap()));
    assert!(source.has_required_files(scan_dir.to_str().unwrap()));
    assert!(!source.has_required_files(scratch.path().to_str().unwrap()));
}

#[test]
fn test_upload_in_progress_is_not_admitted() {
    let scratch = tempfile::tempdir().unwrap();
    let scan_dir = scratch.path().join("VNIR - 2017-04-27__10-55-16-417");
    write_raw_scan(&scan_dir, "VNIR_2017", &synthetic_cube(2, 2, 5));
    fs::remove_file(scan_dir.join("frameIndex.txt")).unwrap();

    let source = EnviRawSource::new(Duration::from_secs(5));
    assert!(!source.has_required_files(scan_dir.to_str().unwrap()));
    // Reading does not need the preview files
    assert!(source
        .read(scan_dir.to_str().unwrap(), &SensorVariant::new("vnir"), ts(2017, 4, 27))
        .is_ok());

    let mut config = test_config(&scratch.path().join("out"));
    config.calibration_root = scratch.path().join("calibration");
    write_bundle_folder(&config.calibration_root, "vnir_20170101_open", 5);
    let orch = Orchestrator::from_config(&config).unwrap();
    let job =
        JobDescriptor::from_dataset_name("VNIR - 2017-04-27__10-55-16-417", scan_dir.to_str().unwrap()).unwrap();
    assert_eq!(orch.admit(&job), Admission::Skip(SkipReason::MissingRawData));

    fs::write(scan_dir.join("frameIndex.txt"), "Frame\tTime\n").unwrap();
    assert_eq!(orch.admit(&job), Admission::Process);
}

#[test]
fn test_oversized_raw_header_fails_as_input_error() {
    init_logging();
    let scratch = tempfile::tempdir().unwrap();
    let scan_dir = scratch.path().join("VNIR - 2017-04-27__10-55-16-417");
    write_raw_scan(&scan_dir, "VNIR_2017", &synthetic_cube(2, 2, 5));
    fs::write(
        scan_dir.join("VNIR_2017_raw.hdr"),
        "ENVI\nsamples = 4294967296\nlines = 4294967296\nbands = 5\ndata type = 12\ninterleave = bil\n",
    )
    .unwrap();

    let mut config = test_config(&scratch.path().join("out"));
    config.calibration_root = scratch.path().join("calibration");
    write_bundle_folder(&config.calibration_root, "vnir_20170101_open", 5);
    let orch = Orchestrator::from_config(&config).unwrap();
    let job =
        JobDescriptor::from_dataset_name("VNIR - 2017-04-27__10-55-16-417", scan_dir.to_str().unwrap()).unwrap();

    let report = orch.run_job(&job);

    assert_eq!(report.state, JobState::Failed);
    let cause = report.cause.unwrap();
    assert_eq!(cause.kind, "InvalidFormat");
    assert_eq!(cause.class, ErrorClass::Input);
    assert!(!cause.is_retryable());
    assert_eq!(report.read_attempts, 1);
    assert!(all_files(&config.output_root).is_empty());
}

#[test]
fn test_end_to_end_from_config() {
    init_logging();
    let scratch = tempfile::tempdir().unwrap();
    let calibration = scratch.path().join("calibration");
    write_bundle_folder(&calibration, "vnir_20170101_20170601", 5);
    write_bundle_folder(&calibration, "vnir_20170601_open", 5);
    // No manifest: rejected, not fatal
    fs::create_dir_all(calibration.join("vnir_20160101_20170101")).unwrap();

    let mut cube = synthetic_cube(4, 3, 5);
    cube[[3, 2, 4]] = 4095;
    let scan_dir = scratch.path().join("raw").join("VNIR - 2017-04-27__10-55-16-417");
    write_raw_scan(&scan_dir, "VNIR_2017", &cube);

    let mut config = test_config(&scratch.path().join("out"));
    config.calibration_root = calibration.clone();
    let orch = Orchestrator::from_config(&config).unwrap();

    let job =
        JobDescriptor::from_dataset_name("VNIR - 2017-04-27__10-55-16-417", scan_dir.to_str().unwrap()).unwrap();
    assert_eq!(orch.admit(&job), Admission::Process);
    let report = orch.run_job(&job);

    assert_eq!(report.state, JobState::Completed, "{:?}", report.cause);
    let artifact = report.artifact.unwrap();
    assert_eq!(artifact.bundle_id, "vnir_20170101_20170601");
    assert_eq!(artifact.format, "envi");
    assert!(artifact
        .location
        .ends_with("vnir/2017-04-27/VNIR_-_2017-04-27__10-55-16-417"));

    let contents = read_artifact(&artifact.location).unwrap();
    assert_eq!(contents.quality_mask[[3, 2]], QA_SATURATED);
    assert_relative_eq!(contents.radiance[[3, 2, 4]], (4095.0 - 10.0) * 0.5);
    assert_eq!(contents.header.get_text("integration_time_ms").as_deref(), Some("20"));
    assert!(contents
        .header
        .get_text("history")
        .unwrap()
        .contains("calibrated VNIR - 2017-04-27__10-55-16-417 with vnir_20170101_20170601"));
}

#[test]
fn test_repository_over_filesystem_loads_each_variant_once() {
    let scratch = tempfile::tempdir().unwrap();
    write_bundle_folder(scratch.path(), "vnir_20170101_open", 3);
    write_bundle_folder(scratch.path(), "swir_20170101_open", 3);
    write_bundle_folder(scratch.path(), "vnir_2017_bad", 3);

    let store = Arc::new(FsBundleStore::new(scratch.path()));
    let repository = Arc::new(CalibrationRepository::new(Arc::clone(&store)));

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let repository = Arc::clone(&repository);
            scope.spawn(move || {
                let bundles = repository.list_bundles(&SensorVariant::new("vnir")).unwrap();
                assert_eq!(bundles.len(), 1);
            });
        }
    });
    assert_eq!(repository.load_count(), 1);

    repository.list_bundles(&SensorVariant::new("swir")).unwrap();
    assert_eq!(repository.load_count(), 2);

    // "vnir_2017_bad" neither parses as a folder name nor names a variant in its manifest
    let rejected = store.rejected();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].path.ends_with("vnir_2017_bad"));
}

#[test]
fn test_batch_keeps_input_order_and_isolates_failures() {
    init_logging();
    let out = tempfile::tempdir().unwrap();
    let repository = Arc::new(CalibrationRepository::from_bundles(vec![
        bundle("B1", "vnir", ts(2017, 1, 1), Some(ts(2017, 6, 1)), 4),
        bundle("B2", "vnir", ts(2017, 6, 1), None, 4),
    ]));
    let source = Arc::new(MemorySource {
        lines: 8,
        samples: 6,
        bands: 4,
    });
    let sink = Arc::new(EnviCubeWriter::new(out.path()));
    let orch = Orchestrator::new(Arc::clone(&repository), source, sink, &test_config(out.path())).unwrap();

    let mut jobs = Vec::new();
    for day in 1..=12u32 {
        let month = if day % 2 == 0 { 3 } else { 9 };
        jobs.push(descriptor(&format!("VNIR - job-{:02}", day), "vnir", ts(2017, month, day)));
    }
    jobs.push(descriptor("SWIR - orphan", "swir", ts(2017, 3, 1)));

    let reports = orch.run_batch(&jobs).unwrap();

    assert_eq!(reports.len(), jobs.len());
    for (job, report) in jobs.iter().zip(&reports) {
        assert_eq!(job.dataset_id, report.dataset_id);
    }
    for (i, report) in reports.iter().take(12).enumerate() {
        assert!(report.is_completed(), "{} failed: {:?}", report.dataset_id, report.cause);
        let expected = if (i + 1) % 2 == 0 { "B1" } else { "B2" };
        assert_eq!(report.artifact.as_ref().unwrap().bundle_id, expected);
    }
    assert_eq!(reports[12].state, JobState::Failed);
    assert_eq!(repository.load_count(), 2);

    let mut ids: Vec<u64> = reports.iter().map(|r| r.job_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), reports.len());
}
