use crate::corpus::{Corpus, SeedId};
use log::trace;
use rand::Rng;
use rand_core::RngCore;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("no seeds to select from: corpus is empty")]
    CorpusEmpty,
}

/// Picks the corpus seed the next mutation starts from.
pub trait Scheduler {
    /// Selects a seed and counts the selection against it.
    fn next(
        &mut self,
        corpus: &mut Corpus,
        total_executions: u64,
        rng: &mut dyn RngCore,
    ) -> Result<SeedId, SchedulerError>;
}

/// AFLFast "explore" energy: seeds that were picked rarely relative to the
/// whole session get exponentially more weight, capped at `max_energy`.
pub fn energy(exec_count: u64, total_executions: u64, max_energy: f64) -> f64 {
    if exec_count == 0 {
        return max_energy;
    }
    let ratio = total_executions as f64 / exec_count as f64;
    if ratio <= 1.0 {
        return 1.0;
    }
    let power = ratio.log2().floor() as i32;
    2f64.powi(power).min(max_energy).max(1.0)
}

/// Energy-proportional weighted draw, recomputed on every call.
#[derive(Debug, Clone)]
pub struct PowerScheduler {
    max_energy: f64,
}

impl PowerScheduler {
    pub fn new(max_energy: f64) -> Self {
        Self {
            max_energy: max_energy.max(1.0),
        }
    }
}

impl Scheduler for PowerScheduler {
    fn next(
        &mut self,
        corpus: &mut Corpus,
        total_executions: u64,
        rng: &mut dyn RngCore,
    ) -> Result<SeedId, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        let mut total = 0.0;
        for seed in corpus.iter_mut() {
            seed.energy = energy(seed.exec_count, total_executions, self.max_energy);
            total += seed.energy;
        }

        let roll = rng.random::<f64>() * total;
        let mut cumulative = 0.0;
        let mut chosen = None;
        for seed in corpus.iter() {
            cumulative += seed.energy;
            if roll < cumulative {
                chosen = Some(seed.id());
                break;
            }
        }
        let id = match chosen.or_else(|| corpus.iter().last().map(|s| s.id())) {
            Some(id) => id,
            None => return Err(SchedulerError::CorpusEmpty),
        };
        if let Some(seed) = corpus.get_mut(id) {
            seed.exec_count += 1;
            trace!("Selected seed {} (energy {:.1}, picks {})", id, seed.energy, seed.exec_count);
        }
        Ok(id)
    }
}
