use crate::config::SamplerSettings;
use crate::coverage::{Address, Edge, KnownEdges, RunCoverage};
use crate::probe::{ProbeError, TargetProbe, sample_once};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("probe lost during sampling: {0}")]
    Probe(#[from] ProbeError),
    #[error("sampling thread did not stop within {0:?}")]
    Wedged(Duration),
    #[error("sampling thread panicked")]
    WorkerPanicked,
    #[error("diagnostic sampling produced no program counter reads")]
    NoSamples,
    #[error("failed to spawn sampling thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Why a sampling window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The orchestrator asked the window to stop after the command returned.
    Signalled,
    SampleCap,
    Deadline,
    /// No globally new edge for the configured number of consecutive samples.
    GlobalSaturation,
    /// The idle address recurred for the configured number of consecutive samples.
    IdleSaturation,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Signalled => "signalled",
            StopReason::SampleCap => "cap",
            StopReason::Deadline => "deadline",
            StopReason::GlobalSaturation => "global-sat",
            StopReason::IdleSaturation => "idle-sat",
        }
    }
}

/// Everything one window observed.
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub coverage: RunCoverage,
    /// In-range samples that took part in edge formation.
    pub samples: u32,
    pub out_of_range: u32,
    pub dropped: u32,
    pub stop_reason: StopReason,
}

/// Result of the pre-fuzzing diagnostic pass.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub samples: Vec<Address>,
    pub failures: u32,
    pub idle: Option<Address>,
    pub idle_ratio: f64,
}

#[derive(Debug, Clone)]
struct WindowPlan {
    settings: SamplerSettings,
    idle: Option<Address>,
    deadline: Instant,
}

fn lock_probe<P>(probe: &Mutex<P>) -> Result<std::sync::MutexGuard<'_, P>, ProbeError> {
    probe
        .lock()
        .map_err(|_| ProbeError::Disconnected("probe lock poisoned".into()))
}

/// The body of one sampling window.
///
/// `previous` starts empty, so the first in-range sample never forms an edge
/// and nothing carries over from an earlier window. Out-of-range samples are
/// discarded before edge formation and saturation counting.
fn run_window<P: TargetProbe>(
    probe: &Mutex<P>,
    known: &KnownEdges,
    plan: &WindowPlan,
    stop: &AtomicBool,
) -> Result<WindowReport, SamplerError> {
    let settings = &plan.settings;
    let mut coverage = RunCoverage::default();
    let mut samples = 0u32;
    let mut out_of_range = 0u32;
    let mut dropped = 0u32;
    let mut previous: Option<Address> = None;
    let mut since_new_edge = 0u32;
    let mut idle_streak = 0u32;
    let interval = settings.sample_interval();

    let stop_reason = loop {
        if stop.load(Ordering::Acquire) {
            break StopReason::Signalled;
        }
        if samples >= settings.max_samples_per_window {
            break StopReason::SampleCap;
        }
        if Instant::now() >= plan.deadline {
            break StopReason::Deadline;
        }

        let sampled = {
            let mut guard = lock_probe(probe)?;
            sample_once(&mut *guard)
        };
        if !interval.is_zero() {
            thread::sleep(interval);
        }

        let pc = match sampled {
            Ok(pc) => pc,
            Err(e) if e.is_disconnect() => return Err(e.into()),
            Err(_) => {
                dropped += 1;
                continue;
            }
        };
        if !settings.in_range(pc) {
            out_of_range += 1;
            continue;
        }

        samples += 1;
        coverage.record_address(pc);
        if let Some(prev) = previous {
            let edge = Edge::new(prev, pc);
            coverage.record_edge(edge);
            if known.contains(&edge) {
                since_new_edge += 1;
            } else {
                since_new_edge = 0;
            }
        }
        previous = Some(pc);

        if plan.idle == Some(pc) {
            idle_streak += 1;
        } else {
            idle_streak = 0;
        }

        if settings.global_saturation_limit > 0 && since_new_edge >= settings.global_saturation_limit {
            break StopReason::GlobalSaturation;
        }
        if settings.idle_saturation_limit > 0 && idle_streak >= settings.idle_saturation_limit {
            break StopReason::IdleSaturation;
        }
    };

    Ok(WindowReport {
        coverage,
        samples,
        out_of_range,
        dropped,
        stop_reason,
    })
}

/// `CoverageSampler` infers coverage by statistically sampling the target's
/// program counter through a [`TargetProbe`].
///
/// Each execution gets exactly one [`SamplingWindow`]: a background thread
/// that halts, reads and resumes the target until it is signalled, hits the
/// sample cap or deadline, or saturates. Because a window mutably borrows
/// the sampler, a second window cannot be opened while one is outstanding.
///
/// The sampler never touches global coverage. It reads the global edge set
/// through a [`KnownEdges`] handle for saturation and hands back a per-run
/// [`RunCoverage`] that the orchestrator merges.
pub struct CoverageSampler<P: TargetProbe> {
    probe: Arc<Mutex<P>>,
    settings: SamplerSettings,
    idle: Option<Address>,
    total_samples: u64,
    total_dropped: u64,
    total_out_of_range: u64,
}

impl<P: TargetProbe> CoverageSampler<P> {
    pub fn new(probe: P, settings: SamplerSettings) -> Self {
        Self {
            probe: Arc::new(Mutex::new(probe)),
            settings,
            idle: None,
            total_samples: 0,
            total_dropped: 0,
            total_out_of_range: 0,
        }
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    pub fn idle_address(&self) -> Option<Address> {
        self.idle
    }

    pub fn set_idle_address(&mut self, idle: Option<Address>) {
        self.idle = idle;
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    pub fn total_out_of_range(&self) -> u64 {
        self.total_out_of_range
    }

    /// Reads up to `count` samples synchronously, spaced by the diagnostic interval.
    ///
    /// Transient failures are counted; a disconnect aborts with the error.
    fn collect(&mut self, count: u32) -> Result<(Vec<Address>, u32), ProbeError> {
        let mut pcs = Vec::with_capacity(count as usize);
        let mut failures = 0;
        for i in 0..count {
            let sampled = {
                let mut guard = lock_probe(&self.probe)?;
                sample_once(&mut *guard)
            };
            match sampled {
                Ok(pc) => pcs.push(pc),
                Err(e) if e.is_disconnect() => return Err(e),
                Err(e) => {
                    failures += 1;
                    debug!("Diagnostic sample dropped: {}", e);
                }
            }
            if i + 1 < count && !self.settings.diagnostic_interval().is_zero() {
                thread::sleep(self.settings.diagnostic_interval());
            }
        }
        Ok((pcs, failures))
    }

    /// Samples the idle target and records the idle address, if one address
    /// takes more than `idle-ratio` of the samples.
    pub fn diagnose(&mut self) -> Result<Diagnosis, SamplerError> {
        let (samples, failures) = self.collect(self.settings.diagnostic_samples)?;
        if samples.is_empty() {
            return Err(SamplerError::NoSamples);
        }

        let mut histogram: HashMap<Address, usize> = HashMap::new();
        for pc in &samples {
            *histogram.entry(*pc).or_insert(0) += 1;
        }
        let (top_pc, top_count) = histogram
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(pc, count)| (*pc, *count))
            .unwrap_or((0, 0));
        let ratio = top_count as f64 / samples.len() as f64;

        self.idle = (ratio > self.settings.idle_ratio).then_some(top_pc);
        match self.idle {
            Some(pc) => info!(
                "Idle address {:#010x} ({:.0}% of {} diagnostic samples)",
                pc,
                ratio * 100.0,
                samples.len()
            ),
            None => info!(
                "No idle address: most common pc {:#010x} at {:.0}%, {} unique of {}",
                top_pc,
                ratio * 100.0,
                histogram.len(),
                samples.len()
            ),
        }

        Ok(Diagnosis {
            samples,
            failures,
            idle: self.idle,
            idle_ratio: ratio,
        })
    }

    /// Post-timeout diagnostic trace of where the target is stuck.
    /// Returns whatever could be read; probe failures just shorten the trace.
    pub fn stuck_trace(&mut self) -> Vec<Address> {
        match self.collect(self.settings.stuck_trace_samples) {
            Ok((pcs, _)) => pcs,
            Err(e) => {
                warn!("Stuck-pc trace aborted: {}", e);
                Vec::new()
            }
        }
    }

    /// Attempts a single sample, retrying transient failures a few times.
    pub fn check_liveness(&mut self) -> Result<Address, ProbeError> {
        const ATTEMPTS: usize = 3;
        let mut last = ProbeError::Transient("no attempt made".into());
        for _ in 0..ATTEMPTS {
            let sampled = {
                let mut guard = lock_probe(&self.probe)?;
                sample_once(&mut *guard)
            };
            match sampled {
                Ok(pc) => return Ok(pc),
                Err(e) if e.is_disconnect() => return Err(e),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Opens the sampling window for one execution.
    ///
    /// `deadline` bounds the window even if nobody signals it.
    pub fn start_window(
        &mut self,
        known: KnownEdges,
        deadline: Instant,
    ) -> Result<SamplingWindow<'_, P>, SamplerError> {
        let plan = WindowPlan {
            settings: self.settings.clone(),
            idle: self.idle,
            deadline,
        };
        let probe = Arc::clone(&self.probe);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let (tx, rx) = channel::bounded(1);

        let worker = thread::Builder::new()
            .name("pc-sampler".into())
            .spawn(move || {
                let result = run_window(&probe, &known, &plan, &worker_stop);
                let _ = tx.send(result);
            })
            .map_err(SamplerError::Spawn)?;

        Ok(SamplingWindow {
            sampler: self,
            stop,
            results: rx,
            worker: Some(worker),
        })
    }

    fn account(&mut self, report: &WindowReport) {
        self.total_samples += u64::from(report.samples);
        self.total_dropped += u64::from(report.dropped);
        self.total_out_of_range += u64::from(report.out_of_range);
    }
}

/// A running sampling window. Owned by the scope of one execution.
///
/// [`SamplingWindow::finish`] signals the worker and joins it with a bounded
/// wait. Dropping an unfinished window does the same and discards the result.
pub struct SamplingWindow<'s, P: TargetProbe> {
    sampler: &'s mut CoverageSampler<P>,
    stop: Arc<AtomicBool>,
    results: Receiver<Result<WindowReport, SamplerError>>,
    worker: Option<JoinHandle<()>>,
}

impl<P: TargetProbe> SamplingWindow<'_, P> {
    pub fn finish(mut self) -> Result<WindowReport, SamplerError> {
        let result = self.stop_and_join();
        if let Ok(report) = &result {
            self.sampler.account(report);
        }
        result
    }

    fn stop_and_join(&mut self) -> Result<WindowReport, SamplerError> {
        self.stop.store(true, Ordering::Release);
        let timeout = self.sampler.settings.join_timeout();
        let Some(worker) = self.worker.take() else {
            return Err(SamplerError::WorkerPanicked);
        };
        match self.results.recv_timeout(timeout) {
            Ok(result) => {
                if worker.join().is_err() {
                    return Err(SamplerError::WorkerPanicked);
                }
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Sampling thread still running after {:?}, abandoning it", timeout);
                Err(SamplerError::Wedged(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                Err(SamplerError::WorkerPanicked)
            }
        }
    }
}

impl<P: TargetProbe> Drop for SamplingWindow<'_, P> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop_and_join() {
                debug!("Discarded sampling window ended with: {}", e);
            }
        }
    }
}
