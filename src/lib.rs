//! Core library for the pulse_daq measurement engine.
//!
//! The engine programs a pulse-timing generator, acquires from detectors against that
//! timing program and records the results with strict index and timestamp guarantees.
//!
//! - [`device`]: capability-described device abstraction and the per-device registry
//! - [`sequence`]: pulse sequence model, templates, compiler and renderers
//! - [`orchestrator`]: arm/start/abort state machine and the acquisition loop
//! - [`recorder`]: run record files and their reader
//! - [`metadata`], [`sweep`]: run description, sweep axes and observables
//! - [`units`], [`diagnostics`]: unit conversion and failure reports

pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod error_recovery;
pub mod logging;
pub mod metadata;
pub mod orchestrator;
pub mod recorder;
pub mod run;
pub mod sequence;
pub mod sweep;
pub mod units;

pub use error::{AppResult, DaqError};
