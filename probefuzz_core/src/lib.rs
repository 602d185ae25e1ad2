pub mod calibration;
pub mod channel;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod crash;
pub mod deterministic;
pub mod fuzzer;
pub mod input;
pub mod mutator;
pub mod operator_schedule;
pub mod probe;
pub mod protocol;
pub mod sampler;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testutil;

pub use channel::{ChannelOutcome, CommandChannel, NvmeCliChannel};
pub use config::ProbeFuzzConfig;
pub use corpus::{Corpus, CorpusError, Seed, SeedId};
pub use coverage::{CoverageState, Edge};
pub use crash::{CrashArtifact, DmesgSnapshot, ExternalLog};
pub use fuzzer::{FuzzError, Fuzzer, SessionEnd, SessionReport, SessionStats};
pub use input::{Candidate, EncodedCommand};
pub use probe::{GdbRemoteProbe, ProbeError, TargetProbe};
pub use sampler::{CoverageSampler, SamplerError};
pub use scheduler::{PowerScheduler, Scheduler, SchedulerError};
