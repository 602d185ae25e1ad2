use crate::coverage::Address;
use crate::input::{Candidate, EncodedCommand, Input};
use log::warn;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

const DMESG_LINES: usize = 80;
const TOP_STUCK: usize = 5;

/// Source of free-form host-side diagnostics attached to a crash artifact.
pub trait ExternalLog {
    fn snapshot(&mut self) -> String;
}

/// Captures the tail of the kernel log.
#[derive(Debug, Clone)]
pub struct DmesgSnapshot {
    lines: usize,
}

impl Default for DmesgSnapshot {
    fn default() -> Self {
        Self { lines: DMESG_LINES }
    }
}

impl DmesgSnapshot {
    fn run(args: &[&str]) -> Option<String> {
        let output = Command::new("dmesg").args(args).output().ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ExternalLog for DmesgSnapshot {
    fn snapshot(&mut self) -> String {
        let Some(text) = Self::run(&["--time-format=iso"]).or_else(|| Self::run(&["-T"])) else {
            warn!("dmesg capture failed");
            return "(dmesg capture failed)".to_string();
        };
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(self.lines);
        lines[start..].join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StuckPc {
    #[serde(serialize_with = "hex_address")]
    pub pc: Address,
    pub count: usize,
    pub ratio: f64,
}

/// Program-counter samples read after the target stopped answering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StuckTrace {
    pub samples: Vec<Address>,
}

impl StuckTrace {
    pub fn new(samples: Vec<Address>) -> Self {
        Self { samples }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn unique(&self) -> Vec<Address> {
        let mut pcs = self.samples.clone();
        pcs.sort_unstable();
        pcs.dedup();
        pcs
    }

    /// Most frequent addresses, highest count first, ties by address.
    pub fn top(&self, n: usize) -> Vec<StuckPc> {
        let mut histogram: HashMap<Address, usize> = HashMap::new();
        for pc in &self.samples {
            *histogram.entry(*pc).or_insert(0) += 1;
        }
        let mut entries: Vec<(Address, usize)> = histogram.into_iter().collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let total = self.samples.len().max(1) as f64;
        entries
            .into_iter()
            .take(n)
            .map(|(pc, count)| StuckPc {
                pc,
                count,
                ratio: count as f64 / total,
            })
            .collect()
    }

    /// One-line reading of the trace shape.
    pub fn verdict(&self) -> &'static str {
        match self.unique().len() {
            0 => "no program counter could be read",
            1 => "target is stopped at a single address (hang or deadlock)",
            2..=3 => "target loops over a few addresses (error handling or busy-wait)",
            _ => "target is cycling through many addresses (possibly a recovery routine)",
        }
    }
}

/// Everything kept about the command that made the target stop answering.
#[derive(Debug, Clone)]
pub struct CrashArtifact {
    pub candidate: Candidate,
    pub encoded: EncodedCommand,
    pub reason: String,
    pub stuck: StuckTrace,
    pub external_log: String,
    pub timestamp_ms: u128,
    pub input_hash: String,
}

impl CrashArtifact {
    pub fn new(
        candidate: Candidate,
        encoded: EncodedCommand,
        reason: impl Into<String>,
        stuck: StuckTrace,
        external_log: String,
    ) -> Self {
        let input_hash = format!("{:x}", md5::compute(candidate.as_bytes()));
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Self {
            candidate,
            encoded,
            reason: reason.into(),
            stuck,
            external_log,
            timestamp_ms,
            input_hash,
        }
    }

    pub fn top_stuck(&self) -> Vec<StuckPc> {
        self.stuck.top(TOP_STUCK)
    }
}

pub(crate) fn hex_address<S: serde::Serializer>(pc: &Address, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{pc:#x}"))
}
