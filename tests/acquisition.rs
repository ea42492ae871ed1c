//! End-to-end acquisition scenarios against simulated devices.

use piccolo_server::config::OutputConfig;
use piccolo_server::control::Control;
use piccolo_server::datadir::DataDir;
use piccolo_server::hardware::dummy::DummySpectrometer;
use piccolo_server::hardware::{DummyShutter, SpectrometerDriver, SpectrometerOpener};
use piccolo_server::scheduler::{JobPayload, Scheduler};
use piccolo_server::shutter::{Shutter, ShutterBank};
use piccolo_server::spectrometer::{AutoStatus, Spectrometer, SpectrometerBank, SpectrometerStatus};
use piccolo_server::spectrum::SpectraList;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn opener(counts_per_ms: f64) -> Arc<SpectrometerOpener> {
    Arc::new(move |serial: &str| {
        Ok(Box::new(
            DummySpectrometer::new(serial)
                .with_time_scale(0.0)
                .with_response(counts_per_ms),
        ) as Box<dyn SpectrometerDriver>)
    })
}

struct Rig {
    datadir: DataDir,
    control: Control,
    spectrometers: SpectrometerBank,
    scheduler: Scheduler,
    _tmp: tempfile::TempDir,
}

async fn rig(counts_per_ms: f64) -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let datadir = DataDir::at_path(tmp.path()).unwrap();
    datadir.set_current_run("R1").unwrap();

    let shutters = ShutterBank::from_shutters(vec![
        Shutter::new("downwelling", Box::<DummyShutter>::default(), false, 400.0).unwrap(),
        Shutter::new("upwelling", Box::<DummyShutter>::default(), true, 600.0).unwrap(),
    ]);
    let channels = shutters.names();

    let mut specs = Vec::new();
    for serial in ["dummy_QEP001", "dummy_QEP002"] {
        specs.push(
            Spectrometer::new(
                serial,
                channels.clone(),
                1.0,
                10_000.0,
                BTreeMap::new(),
                opener(counts_per_ms),
            )
            .unwrap(),
        );
    }
    let spectrometers = SpectrometerBank::from_spectrometers(specs, channels);
    for spec in spectrometers.iter() {
        wait_spec_idle(spec).await;
    }

    let scheduler = Scheduler::in_memory().unwrap();
    let control = Control::new(
        datadir.clone(),
        shutters,
        spectrometers.clone(),
        scheduler.clone(),
        &OutputConfig::default(),
    )
    .unwrap();

    Rig {
        datadir,
        control,
        spectrometers,
        scheduler,
        _tmp: tmp,
    }
}

async fn wait_spec_idle(spec: &Spectrometer) {
    for _ in 0..200 {
        if spec.status() == SpectrometerStatus::Idle && !spec.is_busy() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("spectrometer stuck in {}", spec.status());
}

/// Wait until the controller has picked up a job and finished it again.
async fn wait_batch_done(control: &Control) {
    for _ in 0..100 {
        if control.is_busy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for _ in 0..3000 {
        if !control.is_busy() {
            // Let the writer drain.
            tokio::time::sleep(Duration::from_millis(100)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("controller never went idle");
}

async fn wait_for_file(path: &Path) {
    for _ in 0..300 {
        if path.is_file() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never appeared", path.display());
}

fn read_list(path: &Path) -> SpectraList {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn run_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.file_name().into_string().ok())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_sequence_without_autointegration() {
    let rig = rig(50.0).await;
    rig.control
        .record_sequence(
            Some("R1".into()),
            Some(1),
            Some(-1),
            Some(0.0),
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    wait_batch_done(&rig.control).await;

    let run_dir = rig.datadir.datadir().join("R1");
    let files = run_files(&run_dir);
    assert_eq!(
        files,
        vec!["b0000_s00000_dark.pico", "b0000_s00000_light.pico"],
        "exactly one dark and one light file for sequence 0"
    );

    // 2 shutters x 2 spectrometers, all dark.
    let dark = read_list(&run_dir.join("b0000_s00000_dark.pico"));
    assert_eq!(dark.len(), 4);
    assert!(dark.spectra.iter().all(|s| s.meta.dark));
    assert_eq!((dark.batch, dark.sequence), (0, 0));

    let light = read_list(&run_dir.join("b0000_s00000_light.pico"));
    assert_eq!(light.len(), 4);
    assert!(light.spectra.iter().all(|s| !s.meta.dark));

    assert_eq!(rig.datadir.run("R1").unwrap().current_batch(), 0);
    assert_eq!(rig.control.status(), "idle");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_periodic_autointegration_artifacts() {
    let rig = rig(50.0).await;
    rig.control
        .record_sequence(
            Some("R1".into()),
            Some(4),
            Some(2),
            Some(0.0),
            Some(80.0),
            None,
            None,
            None,
        )
        .await
        .unwrap();
    wait_batch_done(&rig.control).await;

    let run_dir = rig.datadir.datadir().join("R1");
    let files = run_files(&run_dir);
    assert_eq!(
        files,
        vec![
            // autointegrate; dark(0); light(0); light(1);
            // autointegrate; dark(2); light(2); light(3); dark(3)
            "b0000_s00000_dark.pico",
            "b0000_s00000_light.pico",
            "b0000_s00001_light.pico",
            "b0000_s00002_dark.pico",
            "b0000_s00002_light.pico",
            "b0000_s00003_dark.pico",
            "b0000_s00003_light.pico",
        ]
    );

    // The searches converged: 80% of 200000 at 50 counts/ms is 3200 ms.
    for spec in rig.spectrometers.iter() {
        for channel in spec.channels().to_vec() {
            assert_eq!(
                spec.auto_status(&channel).unwrap(),
                AutoStatus::Succeeded,
                "{} {}",
                spec.name(),
                channel
            );
            let t = spec.current_time(&channel).unwrap();
            assert!(
                (t - 3200.0).abs() / 3200.0 < 0.25,
                "integration time {t} far from target"
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_stops_the_sequence() {
    let rig = rig(50.0).await;
    rig.control
        .record_sequence(
            Some("R1".into()),
            Some(4),
            Some(2),
            Some(1.5),
            Some(80.0),
            None,
            None,
            None,
        )
        .await
        .unwrap();

    // Abort while the controller waits out the delay after light(1).
    let run_dir = rig.datadir.datadir().join("R1");
    wait_for_file(&run_dir.join("b0000_s00001_light.pico")).await;
    rig.control.abort().unwrap();
    wait_batch_done(&rig.control).await;

    let files = run_files(&run_dir);
    assert!(
        !files.iter().any(|f| f.contains("s00002")),
        "nothing for sequence 2 after abort: {files:?}"
    );
    assert_eq!(rig.control.status(), "idle");
    // Abort when idle is a domain warning.
    assert!(rig.control.abort().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pause_and_resume() {
    let rig = rig(50.0).await;
    rig.control
        .record_sequence(
            Some("R1".into()),
            Some(3),
            Some(-1),
            Some(0.5),
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    let run_dir = rig.datadir.datadir().join("R1");
    wait_for_file(&run_dir.join("b0000_s00000_light.pico")).await;
    rig.control.pause().unwrap();
    for _ in 0..100 {
        if rig.control.status() == "paused" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rig.control.status(), "paused");
    assert!(rig.control.is_busy());
    // Second pause resumes; the batch then runs to completion.
    rig.control.pause().unwrap();
    wait_batch_done(&rig.control).await;
    assert!(run_dir.join("b0000_s00002_light.pico").is_file());
    assert_eq!(rig.control.status(), "idle");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_controller_rejects_new_batches() {
    let rig = rig(50.0).await;
    rig.control
        .record_sequence(
            Some("R1".into()),
            Some(2),
            Some(-1),
            Some(0.5),
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    for _ in 0..100 {
        if rig.control.is_busy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let err = rig.control.record_dark(None).await.unwrap_err();
    assert!(err.is_domain(), "busy must be a domain error: {err}");
    wait_batch_done(&rig.control).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batches_increase_across_invocations() {
    let rig = rig(50.0).await;
    for expected_batch in 0..2 {
        rig.control.record_dark(Some("R1".into())).await.unwrap();
        wait_batch_done(&rig.control).await;
        assert_eq!(
            rig.datadir.run("R1").unwrap().current_batch(),
            expected_batch
        );
    }
    let run_dir = rig.datadir.datadir().join("R1");
    assert!(run_dir.join("b0000_s00000_dark.pico").is_file());
    assert!(run_dir.join("b0001_s00000_dark.pico").is_file());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scheduled_job_runs_through_poll_loop() {
    let rig = rig(50.0).await;
    let start = chrono::Utc::now() + chrono::Duration::seconds(1);
    rig.scheduler
        .add(
            start,
            JobPayload::Dark { run: "R1".into() },
            None,
            None,
            false,
        )
        .unwrap()
        .unwrap();
    let run_dir = rig.datadir.datadir().join("R1");
    wait_for_file(&run_dir.join("b0000_s00000_dark.pico")).await;
    wait_batch_done(&rig.control).await;
    let job = rig.scheduler.jobs().unwrap().remove(0);
    assert_eq!(job.status, piccolo_server::scheduler::JobStatus::Done);
}
