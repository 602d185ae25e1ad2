use crate::mutator::ByteOp;
use log::info;
use rand::Rng;

const N: usize = ByteOp::COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    /// Uniform operator choice while statistics are gathered.
    Pilot,
    /// Operator choice weighted by observed success rate.
    Core,
}

/// Two-phase adaptive choice of havoc operators.
///
/// A pilot phase picks operators uniformly and records, per operator, how
/// often it was used and how often the execution it took part in was
/// interesting. The core phase then weights operators by that success rate,
/// with a floor so no operator starves. When the core phase ends the
/// statistics are reset and a new pilot phase starts.
///
/// When disabled the schedule always picks uniformly and records nothing.
#[derive(Debug, Clone)]
pub struct OperatorSchedule {
    enabled: bool,
    pilot_period: u64,
    core_period: u64,
    phase: SchedulePhase,
    rounds: u64,
    uses: [u64; N],
    finds: [u64; N],
    weights: [f64; N],
}

impl OperatorSchedule {
    pub fn new(enabled: bool, pilot_period: u64, core_period: u64) -> Self {
        Self {
            enabled,
            pilot_period,
            core_period,
            phase: SchedulePhase::Pilot,
            rounds: 0,
            uses: [0; N],
            finds: [0; N],
            weights: [1.0 / N as f64; N],
        }
    }

    pub fn phase(&self) -> SchedulePhase {
        self.phase
    }

    pub fn weights(&self) -> &[f64; N] {
        &self.weights
    }

    pub fn uses(&self) -> &[u64; N] {
        &self.uses
    }

    pub fn finds(&self) -> &[u64; N] {
        &self.finds
    }

    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> ByteOp {
        if !self.enabled || self.phase == SchedulePhase::Pilot {
            return ByteOp::ALL[rng.random_range(0..N)];
        }
        let mut roll = rng.random::<f64>() * self.weights.iter().sum::<f64>();
        for (op, weight) in ByteOp::ALL.iter().zip(self.weights.iter()) {
            if roll < *weight {
                return *op;
            }
            roll -= weight;
        }
        ByteOp::ALL[N - 1]
    }

    /// Credits every operator applied in one execution.
    pub fn record(&mut self, ops: &[ByteOp], interesting: bool) {
        if !self.enabled {
            return;
        }
        for op in ops {
            self.uses[op.index()] += 1;
            if interesting {
                self.finds[op.index()] += 1;
            }
        }
    }

    /// Advances by one execution and switches phase when the current one is over.
    pub fn tick(&mut self) {
        if !self.enabled {
            return;
        }
        self.rounds += 1;
        match self.phase {
            SchedulePhase::Pilot if self.rounds >= self.pilot_period => {
                self.weights = core_weights(&self.uses, &self.finds);
                self.phase = SchedulePhase::Core;
                self.rounds = 0;
                let summary: Vec<String> = ByteOp::ALL
                    .iter()
                    .zip(self.weights.iter())
                    .map(|(op, w)| format!("{}={:.3}", op.name(), w))
                    .collect();
                info!("Operator schedule entering core phase: {}", summary.join(", "));
            }
            SchedulePhase::Core if self.rounds >= self.core_period => {
                self.uses = [0; N];
                self.finds = [0; N];
                self.weights = [1.0 / N as f64; N];
                self.phase = SchedulePhase::Pilot;
                self.rounds = 0;
                info!("Operator schedule back to pilot phase");
            }
            _ => {}
        }
    }
}

fn core_weights(uses: &[u64; N], finds: &[u64; N]) -> [f64; N] {
    let mut weights = [0.0; N];
    for i in 0..N {
        weights[i] = if uses[i] > 0 {
            finds[i] as f64 / uses[i] as f64
        } else {
            1.0 / N as f64
        };
    }
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        weights.iter_mut().for_each(|w| *w /= total);
    } else {
        weights = [1.0 / N as f64; N];
    }
    let floor = 0.01 / N as f64;
    weights.iter_mut().for_each(|w| *w = w.max(floor));
    let total: f64 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= total);
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn pilot_turns_into_core_after_period() {
        let mut schedule = OperatorSchedule::new(true, 3, 5);
        for _ in 0..2 {
            schedule.tick();
        }
        assert_eq!(schedule.phase(), SchedulePhase::Pilot);
        schedule.tick();
        assert_eq!(schedule.phase(), SchedulePhase::Core);
        for _ in 0..5 {
            schedule.tick();
        }
        assert_eq!(schedule.phase(), SchedulePhase::Pilot);
        assert!(schedule.uses().iter().all(|u| *u == 0), "stats reset on pilot entry");
    }

    #[test]
    fn core_weights_favour_productive_operators() {
        let mut schedule = OperatorSchedule::new(true, 1, 100);
        for _ in 0..10 {
            schedule.record(&[ByteOp::BitFlip], true);
            schedule.record(&[ByteOp::AsciiInt], false);
        }
        schedule.tick();
        let w = schedule.weights();
        let sum: f64 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(w[ByteOp::BitFlip.index()] > w[ByteOp::Interesting8.index()]);
        assert!(w[ByteOp::Interesting8.index()] > w[ByteOp::AsciiInt.index()]);
        assert!(w[ByteOp::AsciiInt.index()] > 0.0, "floor keeps operators alive");
    }

    #[test]
    fn no_finds_at_all_falls_back_to_uniform() {
        let uses = [5; N];
        let finds = [0; N];
        let weights = core_weights(&uses, &finds);
        for w in weights {
            assert!((w - 1.0 / N as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn core_selection_follows_weights() {
        let mut schedule = OperatorSchedule::new(true, 1, 1_000_000);
        for _ in 0..100 {
            schedule.record(&[ByteOp::Splice], true);
        }
        for op in ByteOp::ALL.iter().filter(|op| **op != ByteOp::Splice) {
            schedule.record(&[*op], false);
        }
        schedule.tick();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let splices = (0..1000)
            .filter(|_| schedule.select(&mut rng) == ByteOp::Splice)
            .count();
        assert!(splices > 900, "splice picked {splices} times");
    }

    #[test]
    fn disabled_schedule_records_nothing() {
        let mut schedule = OperatorSchedule::new(false, 1, 1);
        schedule.record(&[ByteOp::BitFlip], true);
        schedule.tick();
        assert_eq!(schedule.phase(), SchedulePhase::Pilot);
        assert_eq!(schedule.uses()[0], 0);
    }
}
