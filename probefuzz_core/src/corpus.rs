use crate::coverage::Edge;
use crate::deterministic::{DetCursor, next_candidate};
use crate::input::{Candidate, Fields, Overrides};
use crate::protocol::{CommandSpec, templates_for};
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Payload used for commands that have no parameter template.
const FALLBACK_PAYLOAD_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("seed I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed seed sidecar {path:?}: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("seed path {0:?} is not a directory")]
    NotADirectory(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeedId(u64);

impl std::fmt::Display for SeedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOrigin {
    /// Generated from the command parameter templates.
    Default,
    /// Loaded from the seed directory.
    User,
    /// Admitted because it reached new coverage.
    Discovered { iteration: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetState {
    Pending(DetCursor),
    Done,
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct Calibration {
    pub stability: f64,
    pub stable_edges: HashSet<Edge>,
}

/// Sidecar JSON stored next to a seed payload. Written for every admitted
/// seed and read back by [`load_seed_dir`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(flatten)]
    pub fields: Fields,
    #[serde(default, skip_serializing_if = "Overrides::is_empty")]
    pub overrides: Overrides,
}

impl SeedRecord {
    pub fn of(candidate: &Candidate) -> Self {
        Self {
            command: Some(candidate.command.name.to_string()),
            fields: candidate.fields,
            overrides: candidate.overrides.clone(),
        }
    }
}

/// A corpus entry. The candidate is fixed once stored; only the scheduling
/// metadata around it changes.
#[derive(Debug, Clone)]
pub struct Seed {
    id: SeedId,
    candidate: Candidate,
    pub origin: SeedOrigin,
    pub exec_count: u64,
    pub energy: f64,
    pub new_edges: usize,
    pub covered_edges: HashSet<Edge>,
    pub favored: bool,
    pub calibration: Option<Calibration>,
    pub deterministic: DetState,
}

impl Seed {
    pub fn id(&self) -> SeedId {
        self.id
    }

    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    /// Default and user seeds survive culling unconditionally.
    pub fn is_protected(&self) -> bool {
        !matches!(self.origin, SeedOrigin::Discovered { .. })
    }

    /// Next child of the deterministic stage, or `None` once it is exhausted
    /// (which marks the seed done).
    pub fn advance_deterministic(&mut self, arith_max: u32) -> Option<Candidate> {
        let DetState::Pending(mut cursor) = self.deterministic else {
            return None;
        };
        match next_candidate(&self.candidate, &mut cursor, arith_max) {
            Some(child) => {
                self.deterministic = DetState::Pending(cursor);
                Some(child)
            }
            None => {
                self.deterministic = DetState::Done;
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CullPolicy {
    /// Culling is skipped while the corpus has at most this many seeds.
    pub min_corpus: usize,
    /// Non-favored seeds executed fewer times than this are kept.
    pub min_exec_count: u64,
    /// 0 disables the hard limit.
    pub hard_limit: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullReport {
    pub skipped: bool,
    pub favored: usize,
    pub removed: usize,
    pub evicted: usize,
}

#[derive(Debug, Default)]
pub struct Corpus {
    seeds: Vec<Seed>,
    next_id: u64,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, candidate: Candidate, origin: SeedOrigin) -> SeedId {
        let id = SeedId(self.next_id);
        self.next_id += 1;
        self.seeds.push(Seed {
            id,
            candidate,
            origin,
            exec_count: 0,
            energy: 1.0,
            new_edges: 0,
            covered_edges: HashSet::new(),
            favored: false,
            calibration: None,
            deterministic: DetState::Skipped,
        });
        id
    }

    pub fn get(&self, id: SeedId) -> Option<&Seed> {
        self.seeds.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SeedId) -> Option<&mut Seed> {
        self.seeds.iter_mut().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Seed> {
        self.seeds.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Seed> {
        self.seeds.iter_mut()
    }

    pub fn ids(&self) -> Vec<SeedId> {
        self.seeds.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Uniformly chosen seed other than `exclude`, used as a splice donor.
    pub fn random_other<R: Rng + ?Sized>(&self, exclude: SeedId, rng: &mut R) -> Option<&Seed> {
        let others: Vec<&Seed> = self.seeds.iter().filter(|s| s.id != exclude).collect();
        if others.is_empty() {
            return None;
        }
        Some(others[rng.random_range(0..others.len())])
    }

    /// Marks, for every covered edge, the seed with the smallest payload as
    /// favored, then drops seeds that no longer contribute uniquely.
    pub fn cull(&mut self, policy: &CullPolicy) -> CullReport {
        if self.seeds.len() <= policy.min_corpus {
            return CullReport {
                skipped: true,
                ..CullReport::default()
            };
        }

        let mut best: HashMap<Edge, (SeedId, usize)> = HashMap::new();
        for seed in &self.seeds {
            let len = seed.candidate.payload.len();
            for edge in &seed.covered_edges {
                match best.get(edge) {
                    Some((_, best_len)) if *best_len <= len => {}
                    _ => {
                        best.insert(*edge, (seed.id, len));
                    }
                }
            }
        }
        let favored: HashSet<SeedId> = best.values().map(|(id, _)| *id).collect();
        for seed in &mut self.seeds {
            seed.favored = favored.contains(&seed.id);
        }

        let before = self.seeds.len();
        self.seeds
            .retain(|s| s.favored || s.is_protected() || s.exec_count < policy.min_exec_count);
        let removed = before - self.seeds.len();

        let mut evicted = 0;
        if policy.hard_limit > 0 && self.seeds.len() > policy.hard_limit {
            let mut evictable: Vec<(u64, SeedId)> = self
                .seeds
                .iter()
                .filter(|s| !s.favored && !s.is_protected())
                .map(|s| (s.exec_count, s.id))
                .collect();
            evictable.sort_unstable_by(|a, b| b.cmp(a));
            let excess = self.seeds.len() - policy.hard_limit;
            let doomed: HashSet<SeedId> = evictable.iter().take(excess).map(|(_, id)| *id).collect();
            self.seeds.retain(|s| !doomed.contains(&s.id));
            evicted = doomed.len();
            info!(
                "Corpus hard limit {}: evicted {} seeds, {} left",
                policy.hard_limit,
                evicted,
                self.seeds.len()
            );
        }

        let report = CullReport {
            skipped: false,
            favored: self.seeds.iter().filter(|s| s.favored).count(),
            removed,
            evicted,
        };
        if removed > 0 {
            info!(
                "Culled corpus {} -> {} ({} favored)",
                before,
                self.seeds.len(),
                report.favored
            );
        }
        report
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CorpusError {
    let path = path.to_path_buf();
    move |source| CorpusError::Io { path, source }
}

/// Well-formed seeds for every enabled command, from the parameter templates.
pub fn default_candidates(commands: &[&'static CommandSpec]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for cmd in commands {
        let before = out.len();
        for t in templates_for(cmd.name) {
            let fields = Fields {
                cdw10: t.cdw10,
                cdw11: t.cdw11,
                cdw12: t.cdw12,
                ..Fields::default()
            };
            debug!("Default seed {} ({:#04x}): {}", cmd.name, cmd.opcode, t.description);
            out.push(Candidate::new(cmd, t.payload.render(), fields));
        }
        if out.len() == before {
            out.push(Candidate::new(cmd, vec![0u8; FALLBACK_PAYLOAD_LEN], Fields::default()));
        }
    }
    out
}

/// Loads user seeds from `dir`.
///
/// Every regular file except `*.json` is a payload. A `<file>.json` sidecar
/// names the command and dwords; without one (or without a command in it)
/// the payload is paired with every enabled command.
pub fn load_seed_dir(dir: &Path, commands: &[&'static CommandSpec]) -> Result<Vec<Candidate>, CorpusError> {
    if !dir.is_dir() {
        return Err(CorpusError::NotADirectory(dir.to_path_buf()));
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.is_file() && path.extension().is_none_or(|ext| ext != "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut out = Vec::new();
    for path in paths {
        let payload = fs::read(&path).map_err(io_err(&path))?;
        let mut sidecar = path.clone().into_os_string();
        sidecar.push(".json");
        let sidecar = PathBuf::from(sidecar);
        let record = if sidecar.is_file() {
            let text = fs::read_to_string(&sidecar).map_err(io_err(&sidecar))?;
            serde_json::from_str(&text).map_err(|source| CorpusError::Sidecar {
                path: sidecar.clone(),
                source,
            })?
        } else {
            SeedRecord::default()
        };

        for cmd in commands {
            if record.command.as_deref().is_some_and(|name| name != cmd.name) {
                continue;
            }
            let mut candidate = Candidate::new(cmd, payload.clone(), record.fields);
            candidate.overrides = record.overrides.clone();
            out.push(candidate);
        }
    }
    info!("Loaded {} seeds from {:?}", out.len(), dir);
    Ok(out)
}
