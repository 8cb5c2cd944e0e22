//! End-to-end runs against mock devices.

mod common;

use common::{bench, bench_with, bench_with_limit, find_files, on_off_trigger, run};
use pulse_daq::device::ConnectionState;
use pulse_daq::orchestrator::{EngineState, Pacing, RunEvent};
use pulse_daq::recorder::RunRecord;
use pulse_daq::run::{AbortFlag, AbortReason, RunStatus};
use pulse_daq::sequence::Repeat;
use pulse_daq::sweep::Observable;
use pulse_daq::DaqError;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[tokio::test]
async fn reference_scenario_records_six_samples() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    let sequence = on_off_trigger(Repeat::count(2).unwrap(), 1.0);
    let program = bench.orchestrator.compile_for("pg", &sequence).await.unwrap();
    assert_eq!(program.total_duration(), Some(Duration::from_millis(500)));

    bench.orchestrator.arm(run("scenario"), program).await.unwrap();
    assert_eq!(bench.orchestrator.state(), EngineState::Armed);

    let mut handle = bench.orchestrator.start().await.unwrap();
    let mut events = handle.subscribe();
    let outcome = handle.join().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.fault.is_none());
    assert!(outcome.recording_error.is_none());
    assert_eq!(bench.orchestrator.state(), EngineState::Completed);

    let record = RunRecord::load(outcome.record_path.unwrap()).unwrap();
    assert!(record.is_complete());
    assert_eq!(record.abort_flag(), Some(AbortFlag::None));
    let indices: Vec<u64> = record.samples.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(record.finalization.as_ref().unwrap().sample_count, 6);

    let summary = record.header.sequence.as_ref().unwrap();
    assert_eq!(summary.segments, 3);
    assert_eq!(summary.repeat, Repeat::count(2).unwrap());
    assert_eq!(record.header.software_revision, "v0.1.0-test");
    assert_eq!(record.header.devices.len(), 2);

    // Generator states follow the On / Off / Trigger pattern, detector counts every trigger.
    let level = |i: usize, ch: &str| record.samples[i].values[&format!("pg/{ch}")].value;
    assert_eq!((level(0, "D0"), level(0, "D1")), (1.0, 1.0));
    assert_eq!((level(1, "D0"), level(1, "D1")), (0.0, 0.0));
    assert_eq!((level(2, "D0"), level(2, "D1")), (1.0, 0.0));
    assert_eq!(level(5, "D0"), 1.0);
    let counts: Vec<f64> = record
        .samples
        .iter()
        .map(|s| s.values["det/counts"].value)
        .collect();
    assert_eq!(counts, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    let mut seen = Vec::new();
    while let Ok(event) = events.recv().await {
        match event {
            RunEvent::Sample(sample) => seen.push(sample.index),
            RunEvent::Finished { status, .. } => {
                assert_eq!(status, RunStatus::Completed);
                break;
            }
        }
    }
    assert_eq!(seen, indices);
}

#[tokio::test]
async fn timestamps_are_monotonic_and_bracketed() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::Nominal).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::count(2).unwrap(), 0.02))
        .await
        .unwrap();
    bench.orchestrator.arm(run("timing"), program).await.unwrap();
    let outcome = bench.orchestrator.start().await.unwrap().join().await.unwrap();

    let record = RunRecord::load(outcome.record_path.unwrap()).unwrap();
    let stamps: Vec<u64> = record.samples.iter().map(|s| s.timestamp_ns).collect();
    assert_eq!(stamps.len(), 6);
    assert!(stamps.windows(2).all(|w| w[1] > w[0]), "{stamps:?}");

    let fin = record.finalization.unwrap();
    let span = (fin.stop_time - record.header.start_time)
        .num_nanoseconds()
        .unwrap();
    assert!(span >= 0);
    assert!(span as u64 >= *stamps.last().unwrap());
    // Nominal pacing holds the loop for the whole program.
    assert!(span as u64 >= Duration::from_millis(10).as_nanos() as u64);
}

#[tokio::test]
async fn user_abort_stops_promptly_and_finalizes() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::Nominal).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::Infinite, 0.05))
        .await
        .unwrap();
    bench.orchestrator.arm(run("abort"), program).await.unwrap();
    let mut handle = bench.orchestrator.start().await.unwrap();
    let mut events = handle.subscribe();

    let mut received = 0;
    while received < 3 {
        if let RunEvent::Sample(_) = events.recv().await.unwrap() {
            received += 1;
        }
    }
    let requested = Instant::now();
    bench
        .orchestrator
        .abort(AbortReason::UserRequested)
        .await
        .unwrap();
    let outcome = handle.join().await.unwrap();
    // One segment is at most 5 ms here; allow generous scheduling slack.
    assert!(requested.elapsed() < Duration::from_secs(1));

    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.run.abort_flag, AbortFlag::User);
    assert!(outcome.run.samples.len() >= 3);
    assert_eq!(bench.orchestrator.state(), EngineState::Aborted);
    assert_eq!(bench.generator.calls_matching("stop_program"), 1);
    // The detector is returned to its default state on the way out.
    assert_eq!(bench.detector.calls_matching("reset"), 1);

    let record = RunRecord::load(outcome.record_path.unwrap()).unwrap();
    assert!(record.is_complete());
    assert_eq!(record.abort_flag(), Some(AbortFlag::User));
    assert_eq!(record.samples.len(), outcome.run.samples.len());
}

#[tokio::test]
async fn abort_after_last_sample_is_still_completed() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::Nominal).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::ONCE, 0.2))
        .await
        .unwrap();
    bench.orchestrator.arm(run("late-abort"), program).await.unwrap();
    let mut handle = bench.orchestrator.start().await.unwrap();
    let mut events = handle.subscribe();

    loop {
        if let RunEvent::Sample(sample) = events.recv().await.unwrap() {
            if sample.index == 2 {
                break;
            }
        }
    }
    handle.abort(AbortReason::UserRequested);
    let outcome = handle.join().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.run.abort_flag, AbortFlag::None);
    let record = RunRecord::load(outcome.record_path.unwrap()).unwrap();
    assert_eq!(record.abort_flag(), Some(AbortFlag::None));
    assert_eq!(record.samples.len(), 3);
}

#[tokio::test]
async fn device_fault_ends_run_as_faulted() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    // Two reads per sample: the fourth read (sample 1, counts) faults.
    bench.detector.fault_after_reads(3);
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::count(2).unwrap(), 1.0))
        .await
        .unwrap();
    bench.orchestrator.arm(run("fault"), program).await.unwrap();
    let outcome = bench.orchestrator.start().await.unwrap().join().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Faulted);
    assert_eq!(outcome.run.abort_flag, AbortFlag::Error);
    assert!(outcome.fault.as_ref().unwrap().is_fault());
    assert!(outcome.run.reason.as_ref().unwrap().contains("overload"));
    assert_eq!(outcome.run.samples.len(), 1);
    assert_eq!(bench.orchestrator.state(), EngineState::Faulted);
    assert_eq!(
        bench.registry.state("det").await.unwrap(),
        ConnectionState::Faulted
    );

    let record = RunRecord::load(outcome.record_path.unwrap()).unwrap();
    assert_eq!(record.abort_flag(), Some(AbortFlag::Error));
    assert_eq!(record.samples.len(), 1);
    assert_eq!(bench.generator.calls_matching("stop_program"), 1);
}

#[tokio::test]
async fn over_budget_sequence_is_rejected_before_any_device_call() {
    let dir = tempdir().unwrap();
    let bench = bench_with_limit(
        dir.path(),
        Pacing::FreeRunning,
        Some(Duration::from_millis(400)),
    )
    .await;
    let calls_before = bench.generator.calls();

    let err = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::count(2).unwrap(), 1.0))
        .await
        .unwrap_err();
    match err {
        DaqError::SequenceValidation { segment, .. } => assert_eq!(segment, Some(2)),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(bench.generator.calls(), calls_before);
    assert_eq!(bench.orchestrator.state(), EngineState::Idle);
}

#[tokio::test]
async fn failed_load_resets_generator_and_stays_idle() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::ONCE, 1.0))
        .await
        .unwrap();

    bench.generator.fail_load(true);
    let err = bench
        .orchestrator
        .arm(run("bad-load"), program.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Arm(_)));
    assert_eq!(bench.generator.calls_matching("reset"), 1);
    assert_eq!(bench.orchestrator.state(), EngineState::Idle);
    assert_eq!(
        bench.registry.state("pg").await.unwrap(),
        ConnectionState::Connected
    );
    assert!(matches!(
        bench.orchestrator.start().await,
        Err(DaqError::InvalidState(_))
    ));

    bench.generator.clear_faults();
    bench.orchestrator.arm(run("retry"), program).await.unwrap();
    assert_eq!(bench.orchestrator.state(), EngineState::Armed);
}

#[tokio::test]
async fn arm_checks_devices_before_touching_hardware() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::ONCE, 1.0))
        .await
        .unwrap();

    bench.registry.disconnect("det").await.unwrap();
    let err = bench
        .orchestrator
        .arm(run("offline"), program.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Arm(_)));

    bench.registry.connect("det").await.unwrap();
    let bad_channel = run("bad-channel")
        .with_detector(pulse_daq::run::DetectorBinding::new("det", &["missing"]));
    assert!(matches!(
        bench.orchestrator.arm(bad_channel, program).await,
        Err(DaqError::Arm(_))
    ));

    assert_eq!(bench.generator.calls_matching("load_program"), 0);
    assert_eq!(bench.orchestrator.state(), EngineState::Idle);
}

#[tokio::test]
async fn abort_while_armed_disarms() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::ONCE, 1.0))
        .await
        .unwrap();
    bench.orchestrator.arm(run("disarm"), program).await.unwrap();

    bench
        .orchestrator
        .abort(AbortReason::UserRequested)
        .await
        .unwrap();
    assert_eq!(bench.orchestrator.state(), EngineState::Idle);
    assert_eq!(bench.generator.calls_matching("reset"), 1);
    assert!(matches!(
        bench.orchestrator.abort(AbortReason::UserRequested).await,
        Err(DaqError::InvalidState(_))
    ));
}

#[tokio::test]
async fn compiled_program_is_reused_across_runs() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::ONCE, 1.0))
        .await
        .unwrap();

    let mut paths = Vec::new();
    for name in ["first", "second"] {
        bench
            .orchestrator
            .arm(run(name), program.clone())
            .await
            .unwrap();
        let outcome = bench.orchestrator.start().await.unwrap().join().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.run.samples.len(), 3);
        paths.push(outcome.record_path.unwrap());
    }
    assert_ne!(paths[0], paths[1]);
    assert_eq!(bench.generator.calls_matching("load_program"), 2);
}

#[tokio::test]
async fn disarm_leaves_idle_even_if_reset_fails() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::ONCE, 1.0))
        .await
        .unwrap();
    bench.orchestrator.arm(run("lost-pg"), program.clone()).await.unwrap();

    bench.registry.disconnect("pg").await.unwrap();
    let err = bench
        .orchestrator
        .abort(AbortReason::UserRequested)
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::NotConnected(_)), "{err:?}");
    assert_eq!(bench.orchestrator.state(), EngineState::Idle);
    assert!(matches!(
        bench.orchestrator.start().await,
        Err(DaqError::InvalidState(_))
    ));

    bench.registry.connect("pg").await.unwrap();
    bench.orchestrator.arm(run("pg-back"), program).await.unwrap();
    assert_eq!(bench.orchestrator.state(), EngineState::Armed);
}

#[tokio::test]
async fn unwritable_record_keeps_samples_in_memory() {
    let dir = tempdir().unwrap();
    // A regular file where the record root should be a directory.
    let root = dir.path().join("not-a-dir");
    std::fs::write(&root, b"occupied").unwrap();
    let bench = bench(&root, Pacing::FreeRunning).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::ONCE, 1.0))
        .await
        .unwrap();
    bench.orchestrator.arm(run("no-disk"), program).await.unwrap();
    let outcome = bench.orchestrator.start().await.unwrap().join().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.recording_error.is_some());
    assert!(outcome.record_path.is_none());
    assert_eq!(outcome.run.samples.len(), 3);
    assert!(outcome
        .run
        .reason
        .as_ref()
        .unwrap()
        .contains("recording failed"));
    assert_eq!(bench.orchestrator.state(), EngineState::Completed);
}

#[tokio::test]
async fn failed_program_start_faults_the_run() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::ONCE, 1.0))
        .await
        .unwrap();
    bench.orchestrator.arm(run("no-start"), program).await.unwrap();
    bench.generator.fail_start(true);
    let outcome = bench.orchestrator.start().await.unwrap().join().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Faulted);
    assert_eq!(outcome.run.abort_flag, AbortFlag::Error);
    assert!(outcome.run.samples.is_empty());
    assert_eq!(bench.detector.calls_matching("read"), 0);
    assert_eq!(bench.orchestrator.state(), EngineState::Faulted);

    let record = RunRecord::load(outcome.record_path.unwrap()).unwrap();
    assert!(record.is_complete());
    assert_eq!(record.abort_flag(), Some(AbortFlag::Error));
    assert!(record.samples.is_empty());
}

#[tokio::test]
async fn slow_detector_times_out_and_faults_the_run() {
    let dir = tempdir().unwrap();
    let bench = bench_with(
        dir.path(),
        Pacing::FreeRunning,
        None,
        Some(Duration::from_millis(20)),
    )
    .await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::count(2).unwrap(), 1.0))
        .await
        .unwrap();
    bench.orchestrator.arm(run("slow"), program).await.unwrap();
    bench.detector.set_latency(Duration::from_millis(200));

    let started = Instant::now();
    let outcome = bench.orchestrator.start().await.unwrap().join().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(outcome.status, RunStatus::Faulted);
    assert!(
        matches!(outcome.fault, Some(DaqError::Timeout { ref device, .. }) if device == "det"),
        "{:?}",
        outcome.fault
    );
    assert_eq!(
        bench.registry.state("det").await.unwrap(),
        ConnectionState::Faulted
    );
    assert_eq!(bench.orchestrator.state(), EngineState::Faulted);
    let record = RunRecord::load(outcome.record_path.unwrap()).unwrap();
    assert_eq!(record.abort_flag(), Some(AbortFlag::Error));
}

#[tokio::test]
async fn error_abort_is_recorded_with_error_flag() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::Nominal).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::Infinite, 0.05))
        .await
        .unwrap();
    bench.orchestrator.arm(run("error-abort"), program).await.unwrap();
    let mut handle = bench.orchestrator.start().await.unwrap();
    let mut events = handle.subscribe();
    while !matches!(events.recv().await.unwrap(), RunEvent::Sample(_)) {}

    bench
        .orchestrator
        .abort(AbortReason::ErrorDetected)
        .await
        .unwrap();
    let outcome = handle.join().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.run.abort_flag, AbortFlag::Error);
    assert!(outcome.fault.is_none());
    let record = RunRecord::load(outcome.record_path.unwrap()).unwrap();
    assert_eq!(record.abort_flag(), Some(AbortFlag::Error));
    let raw = std::fs::read_to_string(&record.path).unwrap();
    assert!(raw.contains("\"abort_flag\":\"error\""), "{raw}");
}

#[tokio::test]
async fn crashed_worker_leaves_engine_idle_and_record_sealed() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::count(2).unwrap(), 1.0))
        .await
        .unwrap();
    bench
        .orchestrator
        .arm(run("crash").with_run_id("crash-run"), program)
        .await
        .unwrap();
    bench.detector.panic_on_read(true);

    let err = bench.orchestrator.start().await.unwrap().join().await.unwrap_err();
    assert!(matches!(err, DaqError::InvalidState(_)), "{err:?}");
    assert_eq!(bench.orchestrator.state(), EngineState::Idle);
    assert_eq!(bench.generator.calls_matching("stop_program"), 1);

    let paths = find_files(dir.path(), "crash-run.csv");
    assert_eq!(paths.len(), 1, "{paths:?}");
    let record = RunRecord::load(&paths[0]).unwrap();
    assert!(record.is_complete());
    assert_eq!(record.abort_flag(), Some(AbortFlag::Error));
    assert_eq!(record.finalization.unwrap().status, RunStatus::Faulted);
}

#[tokio::test]
async fn observable_must_name_a_recorded_channel() {
    let dir = tempdir().unwrap();
    let bench = bench(dir.path(), Pacing::FreeRunning).await;
    let program = bench
        .orchestrator
        .compile_for("pg", &on_off_trigger(Repeat::ONCE, 1.0))
        .await
        .unwrap();

    let mut stray = run("stray");
    stray
        .metadata
        .observables
        .push(Observable::float("rate").from_channel("det/missing"));
    assert!(matches!(
        bench.orchestrator.arm(stray, program.clone()).await,
        Err(DaqError::Arm(_))
    ));
    assert_eq!(bench.generator.calls_matching("load_program"), 0);

    let mut good = run("good");
    good.metadata.observables = vec![
        Observable::float("counts").from_channel("det/counts"),
        Observable::float("gate").from_channel("pg/D1"),
    ];
    bench.orchestrator.arm(good, program).await.unwrap();
    let outcome = bench.orchestrator.start().await.unwrap().join().await.unwrap();
    let record = RunRecord::load(outcome.record_path.unwrap()).unwrap();
    assert_eq!(record.header.observables.len(), 2);
}
