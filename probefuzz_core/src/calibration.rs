use crate::coverage::{Address, Edge, RunCoverage};
use std::collections::{HashMap, HashSet};

/// Accumulates the edge sets of repeated executions of one unmutated seed.
#[derive(Debug, Default)]
pub struct CalibrationTally {
    runs: u32,
    appearances: HashMap<Edge, u32>,
    addresses: HashSet<Address>,
}

#[derive(Debug, Clone, Default)]
pub struct CalibrationResult {
    pub runs: u32,
    /// Edges seen in more than half of the runs.
    pub stable_edges: HashSet<Edge>,
    /// Union of all runs, with the number of runs each edge appeared in.
    pub all_seen: HashMap<Edge, u32>,
    pub addresses: HashSet<Address>,
    /// `|stable_edges| / |all_seen|`, 0.0 when nothing was seen.
    pub stability: f64,
}

impl CalibrationTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn add_run(&mut self, run: &RunCoverage) {
        self.runs += 1;
        for edge in run.edges() {
            *self.appearances.entry(*edge).or_insert(0) += 1;
        }
        self.addresses.extend(run.addresses.iter().copied());
    }

    pub fn finish(self) -> CalibrationResult {
        let stable_edges: HashSet<Edge> = self
            .appearances
            .iter()
            // Strict majority. An edge seen in exactly half of the runs is not stable.
            .filter(|(_, seen)| **seen * 2 > self.runs)
            .map(|(edge, _)| *edge)
            .collect();
        let stability = stable_edges.len() as f64 / self.appearances.len().max(1) as f64;
        CalibrationResult {
            runs: self.runs,
            stable_edges,
            all_seen: self.appearances,
            addresses: self.addresses,
            stability,
        }
    }
}
