//! Shared fixtures: a registry with a mock generator and detector, and the reference
//! On / Off / Trigger sequence.
#![allow(dead_code)]

use pulse_daq::device::mock::{MockControl, MockDetector, MockPulseGenerator};
use pulse_daq::device::DeviceRegistry;
use pulse_daq::metadata::RunMetadata;
use pulse_daq::orchestrator::{Orchestrator, Pacing};
use pulse_daq::recorder::DataRecorder;
use pulse_daq::run::{DetectorBinding, MeasurementRun};
use pulse_daq::sequence::{instantiate_template, PulseSequence, Repeat, TemplateParams};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct Bench {
    pub registry: Arc<DeviceRegistry>,
    pub orchestrator: Orchestrator,
    pub generator: MockControl,
    pub detector: MockControl,
}

pub async fn bench(root: &Path, pacing: Pacing) -> Bench {
    bench_with_limit(root, pacing, None).await
}

pub async fn bench_with_limit(root: &Path, pacing: Pacing, limit: Option<Duration>) -> Bench {
    bench_with(root, pacing, limit, None).await
}

/// `detector_timeout` overrides the per-call timeout of "det".
pub async fn bench_with(
    root: &Path,
    pacing: Pacing,
    limit: Option<Duration>,
    detector_timeout: Option<Duration>,
) -> Bench {
    let registry = Arc::new(DeviceRegistry::new());
    let pg = MockPulseGenerator::new(2);
    let det = MockDetector::new();
    let generator = pg.control();
    let detector = det.control();

    let mut descriptor = MockPulseGenerator::descriptor("pg", 2);
    if let Some(limit) = limit {
        descriptor = descriptor.with_max_sequence_duration(limit);
    }
    registry.register(descriptor, Box::new(pg)).await.unwrap();
    let mut det_descriptor = MockDetector::descriptor("det");
    if let Some(timeout) = detector_timeout {
        det_descriptor = det_descriptor.with_timeout(timeout);
    }
    registry
        .register(det_descriptor, Box::new(det))
        .await
        .unwrap();
    registry.connect("pg").await.unwrap();
    registry.connect("det").await.unwrap();

    let recorder = DataRecorder::new(root).with_revision("v0.1.0-test");
    let orchestrator =
        Orchestrator::new(Arc::clone(&registry), Arc::new(recorder)).with_pacing(pacing);
    Bench {
        registry,
        orchestrator,
        generator,
        detector,
    }
}

/// 100 ms On, 50 ms Off, 100 ms Trigger on two channels, scaled by `scale`.
pub fn on_off_trigger(repeat: Repeat, scale: f64) -> PulseSequence {
    let params = |ms: f64| {
        TemplateParams::new(2).with_duration(Duration::from_secs_f64(ms * scale / 1000.0))
    };
    PulseSequence::concat([
        instantiate_template("On", &params(100.0)).unwrap(),
        instantiate_template("Off", &params(50.0)).unwrap(),
        instantiate_template("Trigger", &params(100.0)).unwrap(),
    ])
    .unwrap()
    .with_repeat(repeat)
}

/// Every file under `dir` whose name is `file_name`.
pub fn find_files(dir: &Path, file_name: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(find_files(&path, file_name));
        } else if path.file_name().is_some_and(|n| n == file_name) {
            found.push(path);
        }
    }
    found
}

pub fn run(name: &str) -> MeasurementRun {
    let metadata = RunMetadata::builder()
        .name(name)
        .measurement_type("confocal")
        .build();
    MeasurementRun::new(metadata, "pg")
        .with_detector(DetectorBinding::new("det", &["signal", "counts"]).triggered())
}
