//! Scan output parser.
//!
//! Translates the scanner's combined byte stream into a lazy sequence of
//! typed [`ScanEvent`]s. The parser is pure (no I/O) and restartable from
//! any byte offset: findings are deduplicated by content id and progress
//! is monotonic, so refeeding an overlap window is harmless.

use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use scanforge_core::domain::{Finding, Severity};

use super::events::{ProgressStage, ScanEvent, TerminalHint};

/// Sliding window width for loop detection.
const LOOP_WINDOW: usize = 20;
/// Fraction of distinct lines below which the window counts as a loop.
const LOOP_DISTINCT_RATIO: f64 = 0.5;

fn finding_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[([^\[\]]+)\]\s+\[([^\[\]]+)\]\s+\[([^\[\]]+)\]\s+(\S+)(?:\s+(.+))?$")
            .expect("finding line regex")
    })
}

fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("ansi escape regex"))
}

/// Stateful, per-stream scan output parser.
pub struct ScanOutputParser {
    partial: Vec<u8>,
    seen_findings: HashSet<String>,
    window: VecDeque<u64>,
    lines_total: u64,
    percent: u8,
    looped: bool,
    terminal_hint: Option<TerminalHint>,
    findings_count: u64,
}

impl Default for ScanOutputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanOutputParser {
    pub fn new() -> Self {
        Self {
            partial: Vec::new(),
            seen_findings: HashSet::new(),
            window: VecDeque::with_capacity(LOOP_WINDOW),
            lines_total: 0,
            percent: 0,
            looped: false,
            terminal_hint: None,
            findings_count: 0,
        }
    }

    /// Feed a chunk of raw bytes; returns the events for every complete
    /// line in the chunk. Partial trailing lines are buffered.
    pub fn push_chunk(&mut self, bytes: &[u8]) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        for byte in bytes {
            if *byte == b'\n' {
                let line = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                self.consume_line(&line, &mut events);
            } else {
                self.partial.push(*byte);
            }
        }
        events
    }

    /// Flush any buffered partial line at end of stream.
    pub fn finish(&mut self) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        if !self.partial.is_empty() {
            let line = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.consume_line(&line, &mut events);
        }
        events
    }

    /// Current monotonic progress percentage.
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Whether a loop was detected; the stream is dead after this.
    pub fn loop_detected(&self) -> bool {
        self.looped
    }

    /// Terminal classification from the scanner's own summary lines.
    pub fn terminal_hint(&self) -> Option<TerminalHint> {
        self.terminal_hint
    }

    /// Number of distinct findings emitted so far.
    pub fn findings_count(&self) -> u64 {
        self.findings_count
    }

    fn consume_line(&mut self, raw_line: &str, events: &mut Vec<ScanEvent>) {
        if self.looped {
            return;
        }

        let line = ansi_escape().replace_all(raw_line, "").trim_end().to_string();
        if line.trim().is_empty() {
            return;
        }

        self.lines_total += 1;
        self.track_for_loops(&line);

        if let Some(stage) = Self::classify_progress(&line) {
            if stage == ProgressStage::Done && self.terminal_hint.is_none() {
                self.terminal_hint = Some(if line.contains("No results found") {
                    TerminalHint::NoResults
                } else {
                    TerminalHint::Completed
                });
            }
            self.emit_progress(stage, &line, events);
        } else if let Some(finding) = Self::parse_finding(&line) {
            if self.seen_findings.insert(finding.finding_id.clone()) {
                self.findings_count += 1;
                events.push(ScanEvent::Finding(finding));
                // Finding activity doubles as a processing signal
                self.emit_progress(ProgressStage::Processing, &line, events);
            }
        } else {
            events.push(ScanEvent::Raw { line });
        }

        if self.window_is_looping() {
            self.looped = true;
            let distinct = self.distinct_in_window();
            events.push(ScanEvent::LoopDetected {
                window: LOOP_WINDOW,
                distinct,
            });
        }
    }

    fn emit_progress(&mut self, stage: ProgressStage, line: &str, events: &mut Vec<ScanEvent>) {
        let percent = stage.percent();
        if percent > self.percent {
            self.percent = percent;
            events.push(ScanEvent::Progress {
                stage,
                percent,
                message: line.to_string(),
            });
        }
    }

    fn classify_progress(line: &str) -> Option<ProgressStage> {
        if line.contains("scan completed")
            || line.contains("Scan completed")
            || line.contains("No results found")
        {
            return Some(ProgressStage::Done);
        }
        if !line.starts_with("[INF]") {
            return None;
        }
        if line.contains("Current") && line.contains("version") {
            Some(ProgressStage::Init)
        } else if line.contains("Found") {
            Some(ProgressStage::TemplatesReady)
        } else if line.contains("Creating runners") {
            Some(ProgressStage::EngineReady)
        } else if line.contains("New Scan Started") {
            Some(ProgressStage::ScanStart)
        } else {
            None
        }
    }

    fn parse_finding(line: &str) -> Option<Finding> {
        let captures = finding_line().captures(line)?;
        let template_id = captures.get(1)?.as_str().trim();
        // Informational prefixes ([INF], [WRN], ...) are not findings
        if matches!(template_id, "INF" | "WRN" | "ERR" | "DBG" | "FTL") {
            return None;
        }
        let protocol = captures.get(2)?.as_str().trim();
        let raw_severity = captures.get(3)?.as_str().trim();
        let target = captures.get(4)?.as_str().trim();
        let details = captures
            .get(5)
            .map(|m| m.as_str().trim().to_string())
            .filter(|d| !d.is_empty());

        let (severity, unknown) = Severity::normalize(raw_severity);
        let mut finding =
            Finding::new(template_id, protocol, severity, target, target).with_unknown_severity(unknown);
        if let Some(details) = details {
            finding = finding.with_details(vec![details]);
        }
        Some(finding)
    }

    fn track_for_loops(&mut self, line: &str) {
        let mut hasher = DefaultHasher::new();
        line.hash(&mut hasher);
        if self.window.len() == LOOP_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(hasher.finish());
    }

    fn distinct_in_window(&self) -> usize {
        self.window.iter().collect::<HashSet<_>>().len()
    }

    fn window_is_looping(&self) -> bool {
        self.lines_total >= (2 * LOOP_WINDOW) as u64
            && self.window.len() == LOOP_WINDOW
            && (self.distinct_in_window() as f64 / LOOP_WINDOW as f64) < LOOP_DISTINCT_RATIO
    }
}
