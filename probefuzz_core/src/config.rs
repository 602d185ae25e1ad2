use crate::protocol::TimeoutGroup;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be within [0, 1], got {value}")]
    ProbabilityOutOfRange { key: &'static str, value: f64 },
    #[error("address-start {start:#x} is above address-end {end:#x}")]
    InvertedAddressRange { start: u32, end: u32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max-energy must be at least 1.0, got {0}")]
    MaxEnergyTooSmall(f64),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default)]
    pub max_executions: Option<u64>,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,
    #[serde(default = "default_max_energy")]
    pub max_energy: f64,
    #[serde(default = "default_random_gen_ratio")]
    pub random_gen_ratio: f64,
    #[serde(default = "default_calibration_runs")]
    pub calibration_runs: u32,
    #[serde(default = "default_cull_interval")]
    pub cull_interval: u64,
    #[serde(default = "default_cull_min_corpus")]
    pub cull_min_corpus: usize,
    #[serde(default = "default_cull_min_exec_count")]
    pub cull_min_exec_count: u64,
    #[serde(default)]
    pub corpus_hard_limit: usize,
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval: u64,
    #[serde(default = "default_status_interval")]
    pub status_interval: u64,
    #[serde(default = "default_edge_confirm_threshold")]
    pub edge_confirm_threshold: u32,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub seed_dir: Option<PathBuf>,
    #[serde(default)]
    pub resume_coverage: Option<PathBuf>,
    #[serde(default)]
    pub rng_seed: Option<u64>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub all_commands: bool,
}

fn default_max_duration_secs() -> u64 {
    3600
}
fn default_max_input_len() -> usize {
    4096
}
fn default_max_energy() -> f64 {
    16.0
}
fn default_random_gen_ratio() -> f64 {
    0.2
}
fn default_calibration_runs() -> u32 {
    3
}
fn default_cull_interval() -> u64 {
    1000
}
fn default_cull_min_corpus() -> usize {
    10
}
fn default_cull_min_exec_count() -> u64 {
    2
}
fn default_liveness_interval() -> u64 {
    1000
}
fn default_status_interval() -> u64 {
    100
}
fn default_edge_confirm_threshold() -> u32 {
    1
}
pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./output/pc_sampling")
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_executions: None,
            max_duration_secs: default_max_duration_secs(),
            max_input_len: default_max_input_len(),
            max_energy: default_max_energy(),
            random_gen_ratio: default_random_gen_ratio(),
            calibration_runs: default_calibration_runs(),
            cull_interval: default_cull_interval(),
            cull_min_corpus: default_cull_min_corpus(),
            cull_min_exec_count: default_cull_min_exec_count(),
            corpus_hard_limit: 0,
            liveness_interval: default_liveness_interval(),
            status_interval: default_status_interval(),
            edge_confirm_threshold: default_edge_confirm_threshold(),
            output_dir: default_output_dir(),
            seed_dir: None,
            resume_coverage: None,
            rng_seed: None,
            commands: Vec::new(),
            all_commands: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SamplerSettings {
    #[serde(default = "default_max_samples_per_window")]
    pub max_samples_per_window: u32,
    #[serde(default)]
    pub sample_interval_us: u64,
    #[serde(default = "default_global_saturation_limit")]
    pub global_saturation_limit: u32,
    #[serde(default = "default_idle_saturation_limit")]
    pub idle_saturation_limit: u32,
    #[serde(default)]
    pub address_start: Option<u32>,
    #[serde(default)]
    pub address_end: Option<u32>,
    #[serde(default = "default_diagnostic_samples")]
    pub diagnostic_samples: u32,
    #[serde(default = "default_diagnostic_interval_ms")]
    pub diagnostic_interval_ms: u64,
    #[serde(default = "default_idle_ratio")]
    pub idle_ratio: f64,
    #[serde(default = "default_stuck_trace_samples")]
    pub stuck_trace_samples: u32,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

fn default_max_samples_per_window() -> u32 {
    500
}
fn default_global_saturation_limit() -> u32 {
    20
}
fn default_idle_saturation_limit() -> u32 {
    10
}
fn default_diagnostic_samples() -> u32 {
    20
}
fn default_diagnostic_interval_ms() -> u64 {
    50
}
fn default_idle_ratio() -> f64 {
    0.3
}
fn default_stuck_trace_samples() -> u32 {
    20
}
fn default_join_timeout_ms() -> u64 {
    2000
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            max_samples_per_window: default_max_samples_per_window(),
            sample_interval_us: 0,
            global_saturation_limit: default_global_saturation_limit(),
            idle_saturation_limit: default_idle_saturation_limit(),
            address_start: None,
            address_end: None,
            diagnostic_samples: default_diagnostic_samples(),
            diagnostic_interval_ms: default_diagnostic_interval_ms(),
            idle_ratio: default_idle_ratio(),
            stuck_trace_samples: default_stuck_trace_samples(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl SamplerSettings {
    /// Whether `pc` lies inside the configured code region. An open bound accepts everything on that side.
    pub fn in_range(&self, pc: u32) -> bool {
        self.address_start.is_none_or(|start| pc >= start)
            && self.address_end.is_none_or(|end| pc <= end)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_micros(self.sample_interval_us)
    }

    pub fn diagnostic_interval(&self) -> Duration {
        Duration::from_millis(self.diagnostic_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutationSettings {
    #[serde(default = "default_splice_probability")]
    pub splice_probability: f64,
    #[serde(default = "default_field_probability")]
    pub field_probability: f64,
    #[serde(default = "default_opcode_override_probability")]
    pub opcode_override_probability: f64,
    #[serde(default = "default_namespace_override_probability")]
    pub namespace_override_probability: f64,
    #[serde(default = "default_queue_swap_probability")]
    pub queue_swap_probability: f64,
    #[serde(default = "default_length_override_probability")]
    pub length_override_probability: f64,
    #[serde(default = "default_oversized_log_probability")]
    pub oversized_log_probability: f64,
    #[serde(default)]
    pub excluded_opcodes: Vec<u8>,
    #[serde(default = "default_true")]
    pub deterministic: bool,
    #[serde(default = "default_deterministic_arith_max")]
    pub deterministic_arith_max: u32,
    #[serde(default = "default_true")]
    pub operator_schedule: bool,
    #[serde(default = "default_pilot_period")]
    pub pilot_period: u64,
    #[serde(default = "default_core_period")]
    pub core_period: u64,
}

fn default_splice_probability() -> f64 {
    0.15
}
fn default_field_probability() -> f64 {
    0.3
}
fn default_opcode_override_probability() -> f64 {
    0.10
}
fn default_namespace_override_probability() -> f64 {
    0.10
}
fn default_queue_swap_probability() -> f64 {
    0.05
}
fn default_length_override_probability() -> f64 {
    0.08
}
fn default_oversized_log_probability() -> f64 {
    0.15
}
fn default_true() -> bool {
    true
}
fn default_deterministic_arith_max() -> u32 {
    10
}
fn default_pilot_period() -> u64 {
    5000
}
fn default_core_period() -> u64 {
    50000
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            splice_probability: default_splice_probability(),
            field_probability: default_field_probability(),
            opcode_override_probability: default_opcode_override_probability(),
            namespace_override_probability: default_namespace_override_probability(),
            queue_swap_probability: default_queue_swap_probability(),
            length_override_probability: default_length_override_probability(),
            oversized_log_probability: default_oversized_log_probability(),
            excluded_opcodes: Vec::new(),
            deterministic: true,
            deterministic_arith_max: default_deterministic_arith_max(),
            operator_schedule: true,
            pilot_period: default_pilot_period(),
            core_period: default_core_period(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_address")]
    pub address: String,
    #[serde(default = "default_pc_register")]
    pub pc_register: u32,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

fn default_probe_address() -> String {
    "127.0.0.1:2331".to_string()
}
fn default_pc_register() -> u32 {
    15
}
fn default_io_timeout_ms() -> u64 {
    500
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            address: default_probe_address(),
            pc_register: default_pc_register(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

/// Per-group command deadlines in milliseconds.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TimeoutTable {
    #[serde(default = "default_command_timeout_ms")]
    pub command: u64,
    #[serde(default = "default_long_timeout_ms")]
    pub format: u64,
    #[serde(default = "default_long_timeout_ms")]
    pub sanitize: u64,
    #[serde(default = "default_fw_commit_timeout_ms")]
    pub fw_commit: u64,
    #[serde(default = "default_aux_timeout_ms")]
    pub telemetry: u64,
    #[serde(default = "default_aux_timeout_ms")]
    pub dsm: u64,
    #[serde(default = "default_aux_timeout_ms")]
    pub flush: u64,
}

fn default_command_timeout_ms() -> u64 {
    8000
}
fn default_long_timeout_ms() -> u64 {
    600_000
}
fn default_fw_commit_timeout_ms() -> u64 {
    120_000
}
fn default_aux_timeout_ms() -> u64 {
    30_000
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self {
            command: default_command_timeout_ms(),
            format: default_long_timeout_ms(),
            sanitize: default_long_timeout_ms(),
            fw_commit: default_fw_commit_timeout_ms(),
            telemetry: default_aux_timeout_ms(),
            dsm: default_aux_timeout_ms(),
            flush: default_aux_timeout_ms(),
        }
    }
}

impl TimeoutTable {
    pub fn deadline(&self, group: TimeoutGroup) -> Duration {
        let ms = match group {
            TimeoutGroup::Command => self.command,
            TimeoutGroup::Format => self.format,
            TimeoutGroup::Sanitize => self.sanitize,
            TimeoutGroup::FwCommit => self.fw_commit,
            TimeoutGroup::Telemetry => self.telemetry,
            TimeoutGroup::Dsm => self.dsm,
            TimeoutGroup::Flush => self.flush,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ChannelSettings {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_namespace")]
    pub namespace: u32,
    #[serde(default = "default_margin_ms")]
    pub margin_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default)]
    pub timeouts: TimeoutTable,
}

fn default_program() -> String {
    "nvme".to_string()
}
fn default_device() -> String {
    "/dev/nvme0".to_string()
}
fn default_namespace() -> u32 {
    1
}
fn default_margin_ms() -> u64 {
    2000
}
fn default_kill_grace_ms() -> u64 {
    5000
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            device: default_device(),
            namespace: default_namespace(),
            margin_ms: default_margin_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            timeouts: TimeoutTable::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProbeFuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub sampler: SamplerSettings,
    #[serde(default)]
    pub mutation: MutationSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub channel: ChannelSettings,
}

impl ProbeFuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: ProbeFuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.mutation;
        let probabilities = [
            ("random-gen-ratio", self.fuzzer.random_gen_ratio),
            ("idle-ratio", self.sampler.idle_ratio),
            ("splice-probability", m.splice_probability),
            ("field-probability", m.field_probability),
            ("opcode-override-probability", m.opcode_override_probability),
            ("namespace-override-probability", m.namespace_override_probability),
            ("queue-swap-probability", m.queue_swap_probability),
            ("length-override-probability", m.length_override_probability),
            ("oversized-log-probability", m.oversized_log_probability),
        ];
        for (key, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { key, value });
            }
        }
        if let (Some(start), Some(end)) = (self.sampler.address_start, self.sampler.address_end) {
            if start > end {
                return Err(ConfigError::InvertedAddressRange { start, end });
            }
        }
        if self.sampler.max_samples_per_window == 0 {
            return Err(ConfigError::Zero("max-samples-per-window"));
        }
        if self.fuzzer.max_input_len == 0 {
            return Err(ConfigError::Zero("max-input-len"));
        }
        if self.fuzzer.max_energy < 1.0 {
            return Err(ConfigError::MaxEnergyTooSmall(self.fuzzer.max_energy));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_document_yields_defaults() {
        let config: ProbeFuzzConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(config.fuzzer.calibration_runs, 3);
        assert_eq!(config.sampler.global_saturation_limit, 20);
        assert_eq!(config.sampler.idle_saturation_limit, 10);
        assert_eq!(config.mutation.pilot_period, 5000);
        assert_eq!(
            config.channel.timeouts.deadline(TimeoutGroup::Command),
            Duration::from_millis(8000)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_file_reads_sections() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[fuzzer]
max-executions = 50
commands = ["Identify", "Read"]

[sampler]
address-start = 0x1000
address-end = 0x2000

[channel.timeouts]
format = 1000
"#
        )
        .expect("write config");
        let config = ProbeFuzzConfig::load_from_file(file.path()).expect("config loads");
        assert_eq!(config.fuzzer.max_executions, Some(50));
        assert_eq!(config.fuzzer.commands.len(), 2);
        assert!(config.sampler.in_range(0x1800));
        assert!(!config.sampler.in_range(0x2001));
        assert_eq!(
            config.channel.timeouts.deadline(TimeoutGroup::Format),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<ProbeFuzzConfig, _> = toml::from_str("[fuzzer]\nbogus = 1\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn validate_catches_bad_values() {
        let mut config = ProbeFuzzConfig::default();
        config.mutation.splice_probability = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ProbabilityOutOfRange { .. })
        ));

        let mut config = ProbeFuzzConfig::default();
        config.sampler.address_start = Some(0x2000);
        config.sampler.address_end = Some(0x1000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvertedAddressRange { .. })
        ));

        let mut config = ProbeFuzzConfig::default();
        config.fuzzer.max_energy = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn open_address_range_accepts_everything() {
        let settings = SamplerSettings::default();
        assert!(settings.in_range(0));
        assert!(settings.in_range(u32::MAX));
    }
}
