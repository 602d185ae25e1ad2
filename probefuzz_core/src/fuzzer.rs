use crate::calibration::CalibrationTally;
use crate::channel::{ChannelOutcome, CommandChannel};
use crate::config::{ConfigError, ProbeFuzzConfig};
use crate::corpus::{
    Calibration, Corpus, CorpusError, CullPolicy, DetState, SeedId, SeedOrigin, default_candidates, load_seed_dir,
};
use crate::coverage::{CoverageError, CoverageState};
use crate::crash::{CrashArtifact, ExternalLog, StuckTrace};
use crate::deterministic::DetCursor;
use crate::input::{Candidate, EncodedCommand};
use crate::mutator::{MutationCounters, MutationEngine};
use crate::probe::{ProbeError, TargetProbe};
use crate::protocol::{CommandSpec, enabled_commands};
use crate::sampler::{CoverageSampler, SamplerError, WindowReport};
use crate::scheduler::{PowerScheduler, Scheduler, SchedulerError};
use crate::store::{ArtifactError, ArtifactStore};
use log::{debug, error, info, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("debug probe is unresponsive: {0}")]
    ProbeLiveness(#[source] ProbeError),
    #[error("sampling thread failed: {0}")]
    SamplerWedged(#[source] SamplerError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("no seeds for the enabled commands")]
    NoSeeds,
}

impl From<SamplerError> for FuzzError {
    fn from(e: SamplerError) -> Self {
        match e {
            SamplerError::Probe(probe) => FuzzError::ProbeLiveness(probe),
            SamplerError::NoSamples => FuzzError::ProbeLiveness(ProbeError::Transient(e.to_string())),
            other => FuzzError::SamplerWedged(other),
        }
    }
}

/// How a session that did not fail ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The execution or time limit was reached.
    Completed,
    /// A command timed out. The target was left as it was.
    TargetHung(Box<CrashArtifact>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandStats {
    pub executions: u64,
    pub interesting: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub status_codes: BTreeMap<i32, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// Every command sent, calibration included.
    pub executions: u64,
    pub calibration_executions: u64,
    pub deterministic_executions: u64,
    pub generated_executions: u64,
    pub mutated_executions: u64,
    pub interesting: u64,
    pub channel_errors: u64,
    pub crashes: u64,
    pub culls: u64,
    pub samples: u64,
    pub dropped_samples: u64,
    pub out_of_range_samples: u64,
    pub corpus_size: usize,
    pub edges: usize,
    pub addresses: usize,
    pub elapsed_secs: f64,
    pub mutations: MutationCounters,
    pub commands: BTreeMap<String, CommandStats>,
}

#[derive(Debug)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Deterministic,
    Generated,
    Mutated,
}

struct Execution {
    encoded: EncodedCommand,
    outcome: ChannelOutcome,
    window: WindowReport,
}

/// One fuzzing session against one target.
///
/// Owns global coverage, the corpus and every collaborator. Each execution
/// opens a sampling window, sends the command, closes the window and then
/// decides on the result, strictly in that order.
pub struct Fuzzer<P: TargetProbe, C: CommandChannel> {
    config: ProbeFuzzConfig,
    commands: Vec<&'static CommandSpec>,
    sampler: CoverageSampler<P>,
    channel: C,
    external_log: Box<dyn ExternalLog>,
    coverage: CoverageState,
    corpus: Corpus,
    scheduler: PowerScheduler,
    mutator: MutationEngine,
    store: ArtifactStore,
    det_queue: VecDeque<SeedId>,
    stats: SessionStats,
    rng: ChaCha8Rng,
}

impl<P: TargetProbe, C: CommandChannel> Fuzzer<P, C> {
    /// Builds a session from a validated configuration.
    pub fn new(
        config: ProbeFuzzConfig,
        probe: P,
        channel: C,
        external_log: Box<dyn ExternalLog>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let seed = config.fuzzer.rng_seed.unwrap_or_else(rand::random);
        info!("RNG seed: {}", seed);
        let commands = enabled_commands(&config.fuzzer.commands, config.fuzzer.all_commands);
        Ok(Self {
            commands,
            sampler: CoverageSampler::new(probe, config.sampler.clone()),
            channel,
            external_log,
            coverage: CoverageState::new(config.fuzzer.edge_confirm_threshold),
            corpus: Corpus::new(),
            scheduler: PowerScheduler::new(config.fuzzer.max_energy),
            mutator: MutationEngine::new(config.mutation.clone(), config.fuzzer.max_input_len),
            store: ArtifactStore::new(&config.fuzzer.output_dir),
            det_queue: VecDeque::new(),
            stats: SessionStats::default(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        })
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn coverage(&self) -> &CoverageState {
        &self.coverage
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Runs the session to its end. Coverage is written to the output
    /// directory on every exit path, errors included.
    pub fn run(&mut self) -> Result<SessionReport, FuzzError> {
        let started = Instant::now();
        let outcome = self.session(started);
        self.refresh_stats(started);

        let saved = self.coverage.save(self.store.root());
        if let Err(e) = &saved {
            error!("Failed to save coverage: {}", e);
        }
        self.log_summary();

        let end = outcome?;
        saved?;
        Ok(SessionReport {
            end,
            stats: self.stats.clone(),
        })
    }

    fn session(&mut self, started: Instant) -> Result<SessionEnd, FuzzError> {
        self.store.prepare()?;
        if let Some(dir) = self.config.fuzzer.resume_coverage.clone() {
            let summary = self.coverage.load(&dir)?;
            info!(
                "Resumed coverage from {:?}: {} addresses, {} edges ({} malformed lines skipped)",
                dir, summary.addresses, summary.edges, summary.skipped_lines
            );
        }

        self.sampler.diagnose()?;
        self.load_seeds()?;

        if let Some(artifact) = self.calibrate()? {
            return Ok(SessionEnd::TargetHung(artifact));
        }
        self.queue_deterministic();
        self.fuzz_loop(started)
    }

    fn load_seeds(&mut self) -> Result<(), FuzzError> {
        if let Some(dir) = self.config.fuzzer.seed_dir.clone() {
            for candidate in load_seed_dir(&dir, &self.commands)? {
                self.corpus.add(candidate, SeedOrigin::User);
            }
        }
        for candidate in default_candidates(&self.commands) {
            self.corpus.add(candidate, SeedOrigin::Default);
        }
        if self.corpus.is_empty() {
            return Err(FuzzError::NoSeeds);
        }
        let names: Vec<&str> = self.commands.iter().map(|c| c.name).collect();
        info!("{} seeds for commands: {}", self.corpus.len(), names.join(", "));
        Ok(())
    }

    /// Runs every initial seed unmutated several times and folds everything
    /// it reached into global coverage. A timeout here ends the session just
    /// like one during fuzzing.
    fn calibrate(&mut self) -> Result<Option<Box<CrashArtifact>>, FuzzError> {
        let runs = self.config.fuzzer.calibration_runs;
        if runs == 0 {
            info!("Calibration disabled");
            return Ok(None);
        }
        info!("Calibrating {} seeds, {} runs each", self.corpus.len(), runs);

        let mut stabilities = Vec::new();
        for id in self.corpus.ids() {
            let Some(candidate) = self.corpus.get(id).map(|s| s.candidate().clone()) else {
                continue;
            };
            let mut tally = CalibrationTally::new();
            for _ in 0..runs {
                let exec = self.execute(&candidate)?;
                self.stats.calibration_executions += 1;
                match exec.outcome {
                    ChannelOutcome::Completed(_) => tally.add_run(&exec.window.coverage),
                    ChannelOutcome::Timeout => {
                        self.merge_calibration(id, tally);
                        let artifact = self.preserve_crash(candidate, exec.encoded, "timeout during calibration");
                        return Ok(Some(artifact));
                    }
                    ChannelOutcome::Error(msg) => {
                        warn!("Calibration of seed {} stopped early: {}", id, msg);
                        break;
                    }
                }
            }
            stabilities.push(self.merge_calibration(id, tally));
        }

        let mean = stabilities.iter().sum::<f64>() / stabilities.len().max(1) as f64;
        info!(
            "Calibration done: mean stability {:.1}%, {} edges, {} addresses",
            mean * 100.0,
            self.coverage.edge_count(),
            self.coverage.address_count()
        );
        Ok(None)
    }

    fn merge_calibration(&mut self, id: SeedId, tally: CalibrationTally) -> f64 {
        let result = tally.finish();
        let added = self.coverage.merge_calibrated(&result.all_seen, &result.addresses);
        if let Some(seed) = self.corpus.get_mut(id) {
            info!(
                "  {} {:<12} cdw10={:#010x} runs={} stable={}/{} ({:.0}%) +{} edges",
                id,
                seed.candidate().label().to_string(),
                seed.candidate().fields.cdw10,
                result.runs,
                result.stable_edges.len(),
                result.all_seen.len(),
                result.stability * 100.0,
                added
            );
            seed.covered_edges = result.all_seen.keys().copied().collect();
            seed.calibration = Some(Calibration {
                stability: result.stability,
                stable_edges: result.stable_edges,
            });
        }
        result.stability
    }

    fn queue_deterministic(&mut self) {
        if !self.config.mutation.deterministic {
            return;
        }
        for seed in self.corpus.iter_mut() {
            seed.deterministic = DetState::Pending(DetCursor::default());
            self.det_queue.push_back(seed.id());
        }
        debug!("{} seeds queued for the deterministic stage", self.det_queue.len());
    }

    fn fuzz_loop(&mut self, started: Instant) -> Result<SessionEnd, FuzzError> {
        let time_limit = Duration::from_secs(self.config.fuzzer.max_duration_secs);
        info!("Fuzzing started");
        loop {
            if let Some(max) = self.config.fuzzer.max_executions {
                if self.stats.executions >= max {
                    info!("Execution limit of {} reached", max);
                    return Ok(SessionEnd::Completed);
                }
            }
            if started.elapsed() >= time_limit {
                info!("Time limit of {:?} reached", time_limit);
                return Ok(SessionEnd::Completed);
            }

            let (candidate, source) = self.next_candidate()?;
            let exec = self.execute(&candidate)?;
            match source {
                Source::Deterministic => self.stats.deterministic_executions += 1,
                Source::Generated => self.stats.generated_executions += 1,
                Source::Mutated => self.stats.mutated_executions += 1,
            }

            match &exec.outcome {
                ChannelOutcome::Error(msg) => {
                    debug!("Discarding {}: {}", exec.encoded.label, msg);
                    self.mutator.report(false);
                }
                ChannelOutcome::Timeout => {
                    self.coverage.evaluate(&exec.window.coverage);
                    let artifact = self.preserve_crash(candidate, exec.encoded, "timeout");
                    return Ok(SessionEnd::TargetHung(artifact));
                }
                ChannelOutcome::Completed(_) => {
                    let interesting = self.consider(candidate, &exec);
                    self.mutator.report(interesting);
                }
            }
            self.mutator.tick();
            self.periodic(started)?;
        }
    }

    fn next_candidate(&mut self) -> Result<(Candidate, Source), FuzzError> {
        let arith_max = self.config.mutation.deterministic_arith_max;
        while let Some(&id) = self.det_queue.front() {
            if let Some(child) = self.corpus.get_mut(id).and_then(|s| s.advance_deterministic(arith_max)) {
                return Ok((child, Source::Deterministic));
            }
            self.det_queue.pop_front();
            debug!("Deterministic stage finished for seed {}", id);
        }

        let generate = self.corpus.is_empty() || self.rng.random::<f64>() < self.config.fuzzer.random_gen_ratio;
        if generate {
            if let Some(candidate) = self.mutator.random_candidate(&self.commands, &mut self.rng) {
                return Ok((candidate, Source::Generated));
            }
        }

        let id = self.scheduler.next(&mut self.corpus, self.stats.executions, &mut self.rng)?;
        let parent = match self.corpus.get(id) {
            Some(seed) => seed.candidate().clone(),
            None => return Err(SchedulerError::CorpusEmpty.into()),
        };
        let donor = self
            .corpus
            .random_other(id, &mut self.rng)
            .map(|s| s.candidate().clone());
        let child = self.mutator.mutate(&parent, donor.as_ref(), &mut self.rng);
        Ok((child, Source::Mutated))
    }

    /// Window open, command sent, window closed. Nothing is evaluated here.
    fn execute(&mut self, candidate: &Candidate) -> Result<Execution, FuzzError> {
        let encoded = candidate.encode(self.config.channel.namespace);
        let deadline = self.config.channel.timeouts.deadline(encoded.timeout_group);
        let window_deadline = Instant::now() + deadline + Duration::from_millis(self.config.channel.margin_ms);

        let window = self.sampler.start_window(self.coverage.known_edges(), window_deadline)?;
        let outcome = self.channel.send(&encoded, deadline);
        let report = window.finish()?;

        self.record(&encoded, &outcome);
        debug!(
            "exec={} {} op={:#04x} {:?} samples={} edges={} oor={} dropped={} stop={}",
            self.stats.executions,
            encoded.label,
            encoded.opcode,
            outcome,
            report.samples,
            report.coverage.edge_count(),
            report.out_of_range,
            report.dropped,
            report.stop_reason.as_str()
        );
        Ok(Execution {
            encoded,
            outcome,
            window: report,
        })
    }

    fn record(&mut self, encoded: &EncodedCommand, outcome: &ChannelOutcome) {
        self.stats.executions += 1;
        let entry = self.stats.commands.entry(encoded.label.to_string()).or_default();
        entry.executions += 1;
        match outcome {
            ChannelOutcome::Completed(code) => *entry.status_codes.entry(*code).or_insert(0) += 1,
            ChannelOutcome::Timeout => entry.timeouts += 1,
            ChannelOutcome::Error(_) => {
                entry.errors += 1;
                self.stats.channel_errors += 1;
            }
        }
    }

    /// Merges a completed run into global coverage and admits the input if
    /// it found anything.
    fn consider(&mut self, candidate: Candidate, exec: &Execution) -> bool {
        let eval = self.coverage.evaluate(&exec.window.coverage);
        if !eval.is_interesting() {
            return false;
        }

        let label = exec.encoded.label.to_string();
        self.stats.interesting += 1;
        if let Some(stats) = self.stats.commands.get_mut(&label) {
            stats.interesting += 1;
        }
        info!(
            "New coverage from {} cdw10={:#010x}: +{} edges, {} bucket changes ({} edges, {} addresses total)",
            label,
            candidate.fields.cdw10,
            eval.new_edges,
            eval.bucket_changes,
            self.coverage.edge_count(),
            self.coverage.address_count()
        );
        if let Err(e) = self.store.save_corpus_entry(&candidate) {
            warn!("Failed to persist corpus entry: {}", e);
        }

        let covered = self.coverage.covered_by(&exec.window.coverage);
        let iteration = self.stats.executions;
        let deterministic = self.config.mutation.deterministic;
        let id = self.corpus.add(candidate, SeedOrigin::Discovered { iteration });
        if let Some(seed) = self.corpus.get_mut(id) {
            seed.new_edges = eval.new_edges;
            seed.covered_edges = covered;
            if deterministic {
                seed.deterministic = DetState::Pending(DetCursor::default());
            }
        }
        if deterministic {
            self.det_queue.push_back(id);
        }
        true
    }

    /// Records where the target is stuck, captures the host log and writes
    /// the crash artifact. The target is not reset or power-cycled.
    fn preserve_crash(&mut self, candidate: Candidate, encoded: EncodedCommand, reason: &str) -> Box<CrashArtifact> {
        error!(
            "[TIMEOUT] {} opcode={:#04x} queue={} nsid={} cdw10={:#010x} did not complete",
            encoded.label,
            encoded.opcode,
            encoded.queue.as_str(),
            encoded.namespace,
            encoded.fields.cdw10
        );
        let stuck = StuckTrace::new(self.sampler.stuck_trace());
        let external_log = self.external_log.snapshot();
        let artifact = CrashArtifact::new(candidate, encoded, reason, stuck, external_log);

        for pc in artifact.top_stuck() {
            error!("  stuck at {:#010x}: {} samples ({:.0}%)", pc.pc, pc.count, pc.ratio * 100.0);
        }
        error!("  {}", artifact.stuck.verdict());

        match self.store.save_crash(&artifact) {
            Ok(path) => error!("Crash input saved to {:?}", path),
            Err(e) => error!("Failed to save crash artifact: {}", e),
        }
        self.stats.crashes += 1;
        error!("Target left in its current state for inspection; session halted");
        Box::new(artifact)
    }

    fn periodic(&mut self, started: Instant) -> Result<(), FuzzError> {
        let n = self.stats.executions;
        let status_interval = self.config.fuzzer.status_interval;
        let cull_interval = self.config.fuzzer.cull_interval;
        let liveness_interval = self.config.fuzzer.liveness_interval;

        if status_interval > 0 && n % status_interval == 0 {
            self.log_status(started);
        }
        if cull_interval > 0 && n % cull_interval == 0 {
            let policy = CullPolicy {
                min_corpus: self.config.fuzzer.cull_min_corpus,
                min_exec_count: self.config.fuzzer.cull_min_exec_count,
                hard_limit: self.config.fuzzer.corpus_hard_limit,
            };
            if !self.corpus.cull(&policy).skipped {
                self.stats.culls += 1;
            }
        }
        if liveness_interval > 0 && n % liveness_interval == 0 {
            if let Err(e) = self.sampler.check_liveness() {
                error!("Probe liveness check failed after {} executions: {}", n, e);
                return Err(FuzzError::ProbeLiveness(e));
            }
        }
        Ok(())
    }

    fn log_status(&self, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64().max(1e-3);
        let n = self.stats.executions;
        info!(
            "[{:.0}s] execs={} ({:.1}/s) corpus={} edges={} pending={} pcs={} interesting={} errors={} samples/exec={:.1} dropped={} schedule={:?}",
            elapsed,
            n,
            n as f64 / elapsed,
            self.corpus.len(),
            self.coverage.edge_count(),
            self.coverage.pending_count(),
            self.coverage.address_count(),
            self.stats.interesting,
            self.stats.channel_errors,
            self.sampler.total_samples() as f64 / n.max(1) as f64,
            self.sampler.total_dropped(),
            self.mutator.schedule().phase()
        );
    }

    fn refresh_stats(&mut self, started: Instant) {
        self.stats.samples = self.sampler.total_samples();
        self.stats.dropped_samples = self.sampler.total_dropped();
        self.stats.out_of_range_samples = self.sampler.total_out_of_range();
        self.stats.corpus_size = self.corpus.len();
        self.stats.edges = self.coverage.edge_count();
        self.stats.addresses = self.coverage.address_count();
        self.stats.elapsed_secs = started.elapsed().as_secs_f64();
        self.stats.mutations = self.mutator.counters();
    }

    fn log_summary(&self) {
        let s = &self.stats;
        info!(
            "Session summary: {} executions in {:.1}s, {} interesting, {} channel errors, {} crashes",
            s.executions, s.elapsed_secs, s.interesting, s.channel_errors, s.crashes
        );
        info!(
            "Coverage: {} edges, {} addresses; corpus {} seeds; samples {} (dropped {}, out of range {})",
            s.edges, s.addresses, s.corpus_size, s.samples, s.dropped_samples, s.out_of_range_samples
        );
        for (label, stats) in &s.commands {
            info!(
                "  {:<24} execs={} interesting={} timeouts={} errors={} status={:?}",
                label, stats.executions, stats.interesting, stats.timeouts, stats.errors, stats.status_codes
            );
        }
    }
}
