//! CLI entry point for pulse_daq
//!
//! ```bash
//! pulse_daq demo --repeats 2            # run the reference sequence on mock devices
//! pulse_daq demo --raster 16            # also print the program rendered to 16 samples
//! pulse_daq demo --script scans/odmr.toml  # store the driving script in the record header
//! pulse_daq inspect data/demo/2024-05-01/130405_demo_1a2b3c4d.csv
//! pulse_daq config --config config/pulse_daq.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulse_daq::config::{DeviceDefinition, Settings};
use pulse_daq::device::mock::{MockDetector, MockPulseGenerator};
use pulse_daq::device::{DeviceDescriptor, DeviceKind, DeviceRegistry};
use pulse_daq::diagnostics::FailureReport;
use pulse_daq::error_recovery::{connect_with_retry, RetryPolicy};
use pulse_daq::metadata::{software_revision, RunMetadata, ScriptProvenance};
use pulse_daq::orchestrator::{Orchestrator, RunEvent};
use pulse_daq::recorder::{DataRecorder, RunRecord};
use pulse_daq::run::{AbortReason, DetectorBinding, MeasurementRun};
use pulse_daq::sequence::render::{rasterize, run_list};
use pulse_daq::sequence::{instantiate_template, CompiledSequence, PulseSequence, Repeat};
use pulse_daq::sweep::Observable;
use pulse_daq::units::Unit;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "pulse_daq")]
#[command(about = "Pulse-sequenced measurement engine", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Missing files fall back to defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run On / Off / Trigger against mock devices and record it
    Demo {
        /// How often the three-segment sequence is played
        #[arg(long, default_value = "2")]
        repeats: u32,

        /// Run name
        #[arg(long, default_value = "demo")]
        name: String,

        /// Play every template at the configured default duration instead of
        /// 100 ms / 50 ms / 100 ms
        #[arg(long)]
        template_defaults: bool,

        /// Also print each channel rendered to this many raster samples
        #[arg(long)]
        raster: Option<usize>,

        /// Script whose path, source and git revision go into the record header
        #[arg(long)]
        script: Option<PathBuf>,
    },

    /// Print the header and status of a run record
    Inspect {
        /// Path to the record file
        file: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", FailureReport::from_anyhow(&err));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load configuration")?;
    pulse_daq::logging::init(&settings.application.log_level);

    match cli.command {
        Commands::Demo {
            repeats,
            name,
            template_defaults,
            raster,
            script,
        } => {
            let script = script
                .map(|path| {
                    ScriptProvenance::capture(&path)
                        .with_context(|| format!("Failed to read script {}", path.display()))
                })
                .transpose()?;
            run_demo(&settings, repeats, &name, template_defaults, raster, script).await
        }
        Commands::Inspect { file } => inspect(file),
        Commands::Config => {
            let text = toml::to_string_pretty(&settings).context("Failed to render settings")?;
            println!("{text}");
            Ok(())
        }
    }
}

async fn run_demo(
    settings: &Settings,
    repeats: u32,
    name: &str,
    template_defaults: bool,
    raster: Option<usize>,
    script: Option<ScriptProvenance>,
) -> Result<()> {
    let registry = Arc::new(DeviceRegistry::new());
    let (generator, detector) = register_devices(&registry, &settings.devices).await?;

    let policy = RetryPolicy::default();
    for id in [&generator, &detector] {
        connect_with_retry(&registry, id, &policy)
            .await
            .with_context(|| format!("Failed to connect '{id}'"))?;
    }

    let recorder = DataRecorder::new(&settings.storage.root)
        .with_extension(&settings.storage.extension)
        .with_revision(software_revision(settings.storage.revision_tag.as_deref()));
    let orchestrator = Orchestrator::new(Arc::clone(&registry), Arc::new(recorder))
        .with_max_duration(settings.sequence.max_duration());

    let channels = registry.descriptor(&generator).await?.output_channels().count();
    let defaults = settings.sequence.template_params(channels);
    let params = |ms: u64| {
        if template_defaults {
            defaults
        } else {
            defaults.with_duration(Duration::from_millis(ms))
        }
    };
    let sequence = PulseSequence::concat([
        instantiate_template("On", &params(100))?,
        instantiate_template("Off", &params(50))?,
        instantiate_template("Trigger", &params(100))?,
    ])?
    .with_repeat(Repeat::count(repeats)?);
    let program = orchestrator
        .compile_for(&generator, &sequence)
        .await
        .context("Sequence rejected")?;
    print_program(&program, raster)?;

    let mut metadata = RunMetadata::builder()
        .name(name)
        .measurement_type("demo")
        .parameter("repeats", serde_json::json!(repeats))
        .observable(
            Observable::float("counts")
                .with_unit(Unit::Counts)
                .from_channel(&format!("{detector}/counts")),
        )
        .observable(
            Observable::float("signal")
                .with_unit(Unit::Volt)
                .from_channel(&format!("{detector}/signal")),
        )
        .build();
    metadata.script = script;
    let run = MeasurementRun::new(metadata, &generator)
        .with_detector(DetectorBinding::new(&detector, &["signal", "counts"]).triggered());
    orchestrator.arm(run, program).await?;

    let mut handle = orchestrator.start().await?;
    let mut events = handle.subscribe();
    let signal = handle.abort_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, aborting run");
            signal.request(AbortReason::UserRequested);
        }
    });

    while let Ok(event) = events.recv().await {
        match event {
            RunEvent::Sample(sample) => println!(
                "#{:<4} t={:>12} ns  {}",
                sample.index,
                sample.timestamp_ns,
                sample
                    .values
                    .iter()
                    .map(|(k, v)| format!("{k}={:.4}{}", v.value, v.unit))
                    .collect::<Vec<_>>()
                    .join("  ")
            ),
            RunEvent::Finished { .. } => break,
        }
    }

    let outcome = handle.join().await?;
    println!("Status: {} ({})", outcome.status, outcome.run.abort_flag);
    if let Some(reason) = &outcome.run.reason {
        println!("Reason: {reason}");
    }
    if let Some(path) = &outcome.record_path {
        println!("Record: {}", path.display());
    }
    if let Some(err) = outcome.fault {
        return Err(err).context("Run faulted");
    }
    Ok(())
}

/// Register configured devices, or a mock generator and detector when none are configured.
async fn register_devices(
    registry: &DeviceRegistry,
    devices: &[DeviceDefinition],
) -> Result<(String, String)> {
    let descriptors: Vec<DeviceDescriptor> = if devices.is_empty() {
        vec![
            MockPulseGenerator::descriptor("pg", 2),
            MockDetector::descriptor("det"),
        ]
    } else {
        devices.iter().map(DeviceDefinition::descriptor).collect()
    };

    let mut generator = None;
    let mut detector = None;
    for descriptor in descriptors {
        let id = descriptor.id.clone();
        match descriptor.kind {
            DeviceKind::PulseGenerator => {
                let channels = descriptor.output_channels().count();
                registry
                    .register(descriptor, Box::new(MockPulseGenerator::new(channels)))
                    .await?;
                generator.get_or_insert(id);
            }
            DeviceKind::Detector => {
                registry
                    .register(descriptor, Box::new(MockDetector::new()))
                    .await?;
                detector.get_or_insert(id);
            }
            DeviceKind::Actuator => {
                info!(device = %id, "Skipping actuator in demo");
            }
        }
    }
    Ok((
        generator.context("No pulse generator configured")?,
        detector.context("No detector configured")?,
    ))
}

/// Print the per-channel run lists of `program`, and optionally a raster of each channel.
fn print_program(program: &CompiledSequence, raster: Option<usize>) -> Result<()> {
    println!(
        "Program: {} segments, period {:?}, {:?}",
        program.segments().len(),
        program.period(),
        program.repeat()
    );
    for channel in program.channel_names() {
        let runs = run_list(program, channel)?;
        println!(
            "  {channel:<4} {}",
            runs.iter()
                .map(|(ns, level)| format!("{ns}ns@{level}"))
                .collect::<Vec<_>>()
                .join(" ")
        );
        if let Some(n) = raster {
            let raster = rasterize(program, channel, n)?;
            println!("       raster @ {} S/s: {:?}", raster.sample_rate, raster.samples);
        }
    }
    Ok(())
}

fn inspect(file: PathBuf) -> Result<()> {
    let record = RunRecord::load(&file)
        .with_context(|| format!("Failed to read record {}", file.display()))?;
    let header = &record.header;
    println!("Run:        {} ({})", header.run_id, header.name);
    println!("Type:       {}", header.measurement_type);
    println!("Revision:   {}", header.software_revision);
    println!("Started:    {}", header.start_time.to_rfc3339());
    for device in &header.devices {
        println!("Device:     {} [{} {}]", device.id, device.vendor, device.model);
    }
    if let Some(seq) = &header.sequence {
        println!(
            "Sequence:   {} segments, {:?}, period {} ns",
            seq.segments, seq.repeat, seq.period_ns
        );
    }
    if !header.sweep.axes.is_empty() {
        let axes: Vec<String> = header
            .sweep
            .axes
            .iter()
            .map(|a| format!("{}[{}]", a.name, a.len()))
            .collect();
        println!(
            "Sweep:      {} ({} points)",
            axes.join(" x "),
            header.sweep.number_points()
        );
    }
    for observable in &header.observables {
        println!(
            "Observable: {} ({:?}){}",
            observable.name,
            observable.format,
            observable
                .channel
                .as_deref()
                .map(|c| format!(" from {c}"))
                .unwrap_or_default()
        );
    }
    if let Some(script) = &header.script {
        println!(
            "Script:     {} @ {} {}",
            script.path.display(),
            script.git_hash.as_deref().unwrap_or("untracked"),
            script.git_tag.as_deref().unwrap_or("")
        );
    }
    println!("Samples:    {}", record.samples.len());
    match &record.finalization {
        Some(fin) => {
            println!("Stopped:    {}", fin.stop_time.to_rfc3339());
            println!("Status:     {}", fin.status);
            println!("Abort flag: {}", fin.abort_flag);
            println!("Reason:     {}", fin.reason);
        }
        None => println!("Status:     incomplete"),
    }
    Ok(())
}
