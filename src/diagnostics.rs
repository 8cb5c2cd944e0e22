//! Structured failure capture.
//!
//! A [`FailureReport`] turns an error into something a user can act on: the top-level
//! message, every underlying cause, and the first backtrace frame that points into a
//! user-authored measurement script (any source file below a `scripts` directory).

use serde::{Deserialize, Serialize};
use std::fmt;

const FILE_NOT_FOUND: &str = "<File not found>";
const LINE_NOT_FOUND: &str = "<Line Number not found>";

/// Directory name that marks user-authored measurement scripts.
pub const SCRIPT_DIR_MARKER: &str = "scripts";

/// Location inside a measurement script where a failure surfaced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLocation {
    /// Path relative to the `scripts` directory.
    pub file: String,
    pub line: Option<u32>,
}

/// A captured failure with its cause chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub message: String,
    pub causes: Vec<String>,
    pub location: Option<ScriptLocation>,
}

impl FailureReport {
    /// Capture an `anyhow` error, including its backtrace when one was recorded.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let backtrace = err.backtrace().to_string();
        let mut chain = err.chain().map(ToString::to_string);
        let message = chain.next().unwrap_or_default();
        Self {
            message,
            causes: chain.collect(),
            location: locate_script_frame(&backtrace, SCRIPT_DIR_MARKER),
        }
    }

    /// Capture any standard error by walking its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            causes,
            location: None,
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error Message: '{}'", self.message)?;
        for cause in &self.causes {
            write!(f, "\n  caused by: {cause}")?;
        }
        let (file, line) = match &self.location {
            Some(location) => (
                location.file.as_str(),
                location
                    .line
                    .map(|line| line.to_string())
                    .unwrap_or_else(|| LINE_NOT_FOUND.to_string()),
            ),
            None => (FILE_NOT_FOUND, LINE_NOT_FOUND.to_string()),
        };
        write!(f, "\nin Script '{file}' at Line {line}")
    }
}

/// Find the first frame in a rendered backtrace whose source path contains `marker`
/// as a directory component.
///
/// Rust backtraces render source locations as `at /path/to/file.rs:LINE:COL`.
pub fn locate_script_frame(backtrace: &str, marker: &str) -> Option<ScriptLocation> {
    backtrace.lines().find_map(|line| {
        let location = line.trim().strip_prefix("at ")?;
        let (path, line_number) = split_location(location);
        let components: Vec<&str> = path.split(['/', '\\']).collect();
        let marker_pos = components.iter().position(|c| *c == marker)?;
        let relative = components[marker_pos + 1..].join("/");
        if relative.is_empty() {
            return None;
        }
        Some(ScriptLocation {
            file: relative,
            line: line_number,
        })
    })
}

/// Split `path:line:col` into the path and the line number.
fn split_location(location: &str) -> (&str, Option<u32>) {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next();
    let middle = parts.next();
    let rest = parts.next();
    match (rest, middle, last) {
        (Some(path), Some(line), Some(_col)) if line.parse::<u32>().is_ok() => {
            (path, line.parse().ok())
        }
        _ => match location.rsplit_once(':') {
            Some((path, line)) if line.parse::<u32>().is_ok() => (path, line.parse().ok()),
            _ => (location, None),
        },
    }
}
