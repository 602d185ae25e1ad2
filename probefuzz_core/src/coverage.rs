use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub type Address = u32;

pub const ADDRESSES_FILE: &str = "coverage.txt";
pub const EDGES_FILE: &str = "coverage_edges.txt";
pub const EDGE_COUNTS_FILE: &str = "coverage_edge_counts.txt";

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("coverage file I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ordered pair of program-counter values observed in two consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub from: Address,
    pub to: Address,
}

impl Edge {
    pub fn new(from: Address, to: Address) -> Self {
        Self { from, to }
    }
}

/// Maps a cumulative hit count onto its logarithmic bucket:
/// 1, 2, 3, 4-7, 8-15, 16-31, 32-127, 128+.
pub fn hit_bucket(count: u64) -> u8 {
    match count {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 4,
        4..=7 => 8,
        8..=15 => 16,
        16..=31 => 32,
        32..=127 => 64,
        _ => 128,
    }
}

/// Edge set and hit counts observed during one sampling window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCoverage {
    pub hits: HashMap<Edge, u32>,
    pub addresses: HashSet<Address>,
}

impl RunCoverage {
    pub fn record_address(&mut self, pc: Address) {
        self.addresses.insert(pc);
    }

    pub fn record_edge(&mut self, edge: Edge) {
        *self.hits.entry(edge).or_insert(0) += 1;
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.hits.keys()
    }

    pub fn edge_count(&self) -> usize {
        self.hits.len()
    }
}

/// Read-only handle on the global edge set, given to the sampling task so it
/// can judge saturation without touching [`CoverageState`].
#[derive(Debug, Clone, Default)]
pub struct KnownEdges(Arc<RwLock<HashSet<Edge>>>);

impl KnownEdges {
    pub fn contains(&self, edge: &Edge) -> bool {
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(edge)
    }

    pub fn len(&self) -> usize {
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, edge: Edge) -> bool {
        self.0
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(edge)
    }

    fn snapshot(&self) -> HashSet<Edge> {
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Result of merging one run into global coverage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub new_edges: usize,
    pub bucket_changes: usize,
}

impl Evaluation {
    pub fn is_interesting(&self) -> bool {
        self.new_edges > 0 || self.bucket_changes > 0
    }

    pub fn score(&self) -> usize {
        self.new_edges + self.bucket_changes
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub addresses: usize,
    pub edges: usize,
    pub counts: usize,
    pub skipped_lines: usize,
}

/// Process-wide coverage, owned and mutated by the orchestrator thread only.
#[derive(Debug)]
pub struct CoverageState {
    edges: KnownEdges,
    counts: HashMap<Edge, u64>,
    buckets: HashMap<Edge, u8>,
    pending: HashMap<Edge, u32>,
    addresses: HashSet<Address>,
    confirm_threshold: u32,
}

impl Default for CoverageState {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CoverageState {
    /// `confirm_threshold` is the number of sightings a never-seen edge needs
    /// before it is promoted. 1 promotes on first sighting.
    pub fn new(confirm_threshold: u32) -> Self {
        Self {
            edges: KnownEdges::default(),
            counts: HashMap::new(),
            buckets: HashMap::new(),
            pending: HashMap::new(),
            addresses: HashSet::new(),
            confirm_threshold: confirm_threshold.max(1),
        }
    }

    pub fn known_edges(&self) -> KnownEdges {
        self.edges.clone()
    }

    pub fn contains(&self, edge: &Edge) -> bool {
        self.edges.contains(edge)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn hit_count(&self, edge: &Edge) -> u64 {
        self.counts.get(edge).copied().unwrap_or(0)
    }

    pub fn bucket(&self, edge: &Edge) -> u8 {
        self.buckets.get(edge).copied().unwrap_or(0)
    }

    pub fn edges(&self) -> HashSet<Edge> {
        self.edges.snapshot()
    }

    /// Merges one run and reports whether it found anything.
    ///
    /// A run is interesting when it promotes an edge into the global set or
    /// moves an already-counted edge into a different hit bucket. Bucket
    /// transitions are only tracked for promoted edges.
    pub fn evaluate(&mut self, run: &RunCoverage) -> Evaluation {
        self.addresses.extend(run.addresses.iter().copied());

        let mut eval = Evaluation::default();
        for edge in run.edges() {
            if self.edges.contains(edge) {
                continue;
            }
            let seen = self.pending.entry(*edge).or_insert(0);
            *seen += 1;
            if *seen >= self.confirm_threshold {
                self.pending.remove(edge);
                self.edges.insert(*edge);
                eval.new_edges += 1;
            }
        }

        for (edge, hits) in &run.hits {
            let old_total = self.hit_count(edge);
            let new_total = old_total + u64::from(*hits);
            self.counts.insert(*edge, new_total);
            if !self.edges.contains(edge) {
                continue;
            }
            let new_bucket = hit_bucket(new_total);
            if self.bucket(edge) != new_bucket {
                self.buckets.insert(*edge, new_bucket);
                if old_total > 0 {
                    eval.bucket_changes += 1;
                }
            }
        }
        eval
    }

    /// Folds calibration results in: every edge seen in any run is promoted
    /// directly and its count grows by the number of runs it appeared in.
    pub fn merge_calibrated(&mut self, appearances: &HashMap<Edge, u32>, addresses: &HashSet<Address>) -> usize {
        self.addresses.extend(addresses.iter().copied());
        let mut added = 0;
        for (edge, seen) in appearances {
            if self.edges.insert(*edge) {
                added += 1;
            }
            self.pending.remove(edge);
            let total = self.hit_count(edge) + u64::from(*seen);
            self.counts.insert(*edge, total);
            self.buckets.insert(*edge, hit_bucket(total));
        }
        added
    }

    /// Edges of `run` that are part of global coverage.
    pub fn covered_by(&self, run: &RunCoverage) -> HashSet<Edge> {
        run.edges().filter(|e| self.edges.contains(e)).copied().collect()
    }

    pub fn save(&self, dir: &Path) -> Result<(), CoverageError> {
        fs::create_dir_all(dir).map_err(|source| CoverageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut addresses: Vec<_> = self.addresses.iter().copied().collect();
        addresses.sort_unstable();
        write_lines(&dir.join(ADDRESSES_FILE), addresses.iter().map(|a| format!("{a:#x}")))?;

        let mut edges: Vec<_> = self.edges.snapshot().into_iter().collect();
        edges.sort_unstable();
        write_lines(
            &dir.join(EDGES_FILE),
            edges.iter().map(|e| format!("{:#x},{:#x}", e.from, e.to)),
        )?;

        let mut counts: Vec<_> = self.counts.iter().filter(|(e, _)| self.edges.contains(e)).collect();
        counts.sort_unstable();
        write_lines(
            &dir.join(EDGE_COUNTS_FILE),
            counts
                .iter()
                .map(|(e, c)| format!("{:#x},{:#x},{}", e.from, e.to, c)),
        )?;

        info!(
            "Saved coverage to {:?}: {} addresses, {} edges",
            dir,
            addresses.len(),
            edges.len()
        );
        Ok(())
    }

    /// Restores persisted coverage. Counts are set, not added, so loading the
    /// same directory twice leaves the state unchanged. Missing files are
    /// skipped; malformed lines are counted and ignored.
    pub fn load(&mut self, dir: &Path) -> Result<LoadSummary, CoverageError> {
        let mut summary = LoadSummary::default();

        if let Some(lines) = read_lines(&dir.join(ADDRESSES_FILE))? {
            for line in lines {
                match parse_hex(&line) {
                    Some(addr) => {
                        self.addresses.insert(addr);
                        summary.addresses += 1;
                    }
                    None => summary.skipped_lines += 1,
                }
            }
        }

        if let Some(lines) = read_lines(&dir.join(EDGES_FILE))? {
            for line in lines {
                let mut parts = line.split(',');
                match (parts.next().and_then(parse_hex), parts.next().and_then(parse_hex)) {
                    (Some(from), Some(to)) => {
                        let edge = Edge::new(from, to);
                        self.edges.insert(edge);
                        self.pending.remove(&edge);
                        summary.edges += 1;
                    }
                    _ => summary.skipped_lines += 1,
                }
            }
        }

        if let Some(lines) = read_lines(&dir.join(EDGE_COUNTS_FILE))? {
            for line in lines {
                let mut parts = line.split(',');
                let from = parts.next().and_then(parse_hex);
                let to = parts.next().and_then(parse_hex);
                let count = parts.next().and_then(|c| c.trim().parse::<u64>().ok());
                match (from, to, count) {
                    (Some(from), Some(to), Some(count)) => {
                        let edge = Edge::new(from, to);
                        self.counts.insert(edge, count);
                        self.buckets.insert(edge, hit_bucket(count));
                        summary.counts += 1;
                    }
                    _ => summary.skipped_lines += 1,
                }
            }
        }

        if summary.skipped_lines > 0 {
            debug!("Skipped {} malformed coverage lines in {:?}", summary.skipped_lines, dir);
        }
        info!(
            "Loaded coverage from {:?}: {} addresses, {} edges, {} counts",
            dir, summary.addresses, summary.edges, summary.counts
        );
        Ok(summary)
    }
}

fn parse_hex(token: &str) -> Option<Address> {
    let token = token.trim();
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    if digits.is_empty() {
        return None;
    }
    Address::from_str_radix(digits, 16).ok()
}

fn write_lines(path: &Path, lines: impl Iterator<Item = String>) -> Result<(), CoverageError> {
    let io_err = |source| CoverageError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = fs::File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    for line in lines {
        writeln!(writer, "{line}").map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

fn read_lines(path: &Path) -> Result<Option<Vec<String>>, CoverageError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from)
                .collect(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CoverageError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run_of(edges: &[(Address, Address, u32)]) -> RunCoverage {
        let mut run = RunCoverage::default();
        for &(from, to, hits) in edges {
            run.record_address(from);
            run.record_address(to);
            for _ in 0..hits {
                run.record_edge(Edge::new(from, to));
            }
        }
        run
    }

    #[test]
    fn bucket_ranges() {
        let expected = [
            (0, 0),
            (1, 1),
            (2, 2),
            (3, 4),
            (4, 8),
            (7, 8),
            (8, 16),
            (15, 16),
            (16, 32),
            (31, 32),
            (32, 64),
            (127, 64),
            (128, 128),
            (10_000, 128),
        ];
        for (count, bucket) in expected {
            assert_eq!(hit_bucket(count), bucket, "count {count}");
        }
    }

    #[test]
    fn bucket_never_decreases_as_count_grows() {
        let mut last = 0;
        for count in 0..1000 {
            let b = hit_bucket(count);
            assert!(b >= last, "bucket dropped at count {count}");
            last = b;
        }
    }

    #[test]
    fn accumulated_hits_walk_through_every_bucket() {
        let mut state = CoverageState::default();
        let edge = Edge::new(0x100, 0x104);
        let cumulative = [1u64, 2, 3, 5, 7, 9, 20, 40, 200];
        let mut seen_buckets = Vec::new();
        let mut total = 0;
        for target in cumulative {
            let delta = u32::try_from(target - total).expect("small delta");
            total = target;
            state.evaluate(&run_of(&[(0x100, 0x104, delta)]));
            assert_eq!(state.hit_count(&edge), target);
            seen_buckets.push(state.bucket(&edge));
        }
        assert_eq!(seen_buckets, vec![1, 2, 4, 8, 8, 16, 32, 64, 128]);
    }

    #[test]
    fn new_edge_then_bucket_change_are_interesting() {
        let mut state = CoverageState::default();
        let first = state.evaluate(&run_of(&[(1, 2, 1)]));
        assert_eq!(first.new_edges, 1);
        assert_eq!(first.bucket_changes, 0, "first sighting is not a transition");
        assert!(first.is_interesting());

        let second = state.evaluate(&run_of(&[(1, 2, 1)]));
        assert_eq!(second.new_edges, 0);
        assert_eq!(second.bucket_changes, 1, "count 1 -> 2 moves bucket");
        assert!(second.is_interesting());

        // 2 -> 3 moves bucket 2 -> 4; 3 -> 4 moves 4 -> 8; 4 -> 5 stays in 8.
        state.evaluate(&run_of(&[(1, 2, 1)]));
        state.evaluate(&run_of(&[(1, 2, 1)]));
        let stale = state.evaluate(&run_of(&[(1, 2, 1)]));
        assert!(!stale.is_interesting());
    }

    #[test]
    fn edge_confirmation_holds_edges_pending() {
        let mut state = CoverageState::new(2);
        let edge = Edge::new(7, 8);
        let first = state.evaluate(&run_of(&[(7, 8, 1)]));
        assert!(!first.is_interesting());
        assert!(!state.contains(&edge));
        assert_eq!(state.pending_count(), 1);

        let second = state.evaluate(&run_of(&[(7, 8, 1)]));
        assert_eq!(second.new_edges, 1);
        assert!(state.contains(&edge));
        assert_eq!(state.pending_count(), 0);
        assert_eq!(state.bucket(&edge), hit_bucket(state.hit_count(&edge)));
    }

    #[test]
    fn calibration_merge_adds_appearances() {
        let mut state = CoverageState::default();
        let e1 = Edge::new(1, 2);
        let appearances = HashMap::from([(e1, 3)]);
        let added = state.merge_calibrated(&appearances, &HashSet::from([1, 2]));
        assert_eq!(added, 1);
        assert_eq!(state.hit_count(&e1), 3);
        assert_eq!(state.bucket(&e1), 4);
        assert_eq!(state.address_count(), 2);
    }

    #[test]
    fn covered_by_intersects_with_global() {
        let mut state = CoverageState::new(2);
        state.evaluate(&run_of(&[(1, 2, 1)]));
        state.evaluate(&run_of(&[(1, 2, 1)]));
        let run = run_of(&[(1, 2, 1), (3, 4, 1)]);
        let covered = state.covered_by(&run);
        assert_eq!(covered, HashSet::from([Edge::new(1, 2)]));
    }

    #[test]
    fn save_then_double_load_is_idempotent() {
        let dir = tempdir().expect("temp dir");
        let mut original = CoverageState::default();
        original.evaluate(&run_of(&[(0x1000, 0x1004, 3), (0x1004, 0x2000, 40)]));
        original.save(dir.path()).expect("save coverage");

        let mut restored = CoverageState::default();
        restored.load(dir.path()).expect("first load");
        let edges_once = restored.edges();
        let counts_once = restored.counts.clone();
        let buckets_once = restored.buckets.clone();

        restored.load(dir.path()).expect("second load");
        assert_eq!(restored.edges(), edges_once);
        assert_eq!(restored.counts, counts_once);
        assert_eq!(restored.buckets, buckets_once);

        assert_eq!(restored.edges(), original.edges());
        assert_eq!(restored.hit_count(&Edge::new(0x1004, 0x2000)), 40);
        assert_eq!(restored.bucket(&Edge::new(0x1004, 0x2000)), 64);
        assert_eq!(restored.address_count(), 3);
    }

    #[test]
    fn load_skips_malformed_lines_and_missing_files() {
        let dir = tempdir().expect("temp dir");
        fs::write(
            dir.path().join(EDGES_FILE),
            "0x10,0x20\nnot-an-edge\n# comment\n30,40\n",
        )
        .expect("write edges");
        let mut state = CoverageState::default();
        let summary = state.load(dir.path()).expect("load");
        assert_eq!(summary.edges, 2);
        assert_eq!(summary.skipped_lines, 1);
        assert!(state.contains(&Edge::new(0x30, 0x40)));
        assert_eq!(summary.counts, 0);
    }

    #[test]
    fn persisted_line_formats() {
        let dir = tempdir().expect("temp dir");
        let mut state = CoverageState::default();
        state.evaluate(&run_of(&[(0xA0, 0xB4, 2)]));
        state.save(dir.path()).expect("save");
        let edges = fs::read_to_string(dir.path().join(EDGES_FILE)).expect("edges file");
        let counts = fs::read_to_string(dir.path().join(EDGE_COUNTS_FILE)).expect("counts file");
        assert_eq!(edges.trim(), "0xa0,0xb4");
        assert_eq!(counts.trim(), "0xa0,0xb4,2");
    }
}
