//! Typed events produced from the scanner's output stream.

use serde::{Deserialize, Serialize};

use scanforge_core::domain::Finding;

/// Which container stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// A chunk of container log bytes, tagged with its source stream and the
/// byte offset within that stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub source: LogSource,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Coarse progress stages of a scan run, with fixed percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Init,
    TemplatesReady,
    EngineReady,
    ScanStart,
    Processing,
    Done,
}

impl ProgressStage {
    pub fn percent(&self) -> u8 {
        match self {
            ProgressStage::Init => 5,
            ProgressStage::TemplatesReady => 30,
            ProgressStage::EngineReady => 70,
            ProgressStage::ScanStart => 90,
            ProgressStage::Processing => 95,
            ProgressStage::Done => 100,
        }
    }
}

/// Terminal classification hinted by the scanner's own summary lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalHint {
    Completed,
    NoResults,
}

/// A typed event parsed from one line of scanner output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Finding(Finding),
    Progress {
        stage: ProgressStage,
        percent: u8,
        message: String,
    },
    Raw {
        line: String,
    },
    /// The stream degenerated into a repeating loop; fatal for the job.
    LoopDetected {
        window: usize,
        distinct: usize,
    },
}
