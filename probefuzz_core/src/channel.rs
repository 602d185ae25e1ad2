use crate::config::ChannelSettings;
use crate::input::{EncodedCommand, Transfer};
use log::{debug, error, warn};
use std::io::Write;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// The command completed; the value is the controller status code.
    Completed(i32),
    /// The target did not answer within the deadline.
    Timeout,
    /// Delivery itself failed. The execution is discarded.
    Error(String),
}

impl ChannelOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelOutcome::Timeout)
    }
}

pub trait CommandChannel {
    /// Delivers one command and blocks until it completes or `deadline` passes.
    fn send(&mut self, command: &EncodedCommand, deadline: Duration) -> ChannelOutcome;
}

/// [`CommandChannel`] that shells out to the `nvme` CLI passthrough commands.
pub struct NvmeCliChannel {
    settings: ChannelSettings,
}

enum WaitResult {
    Exited(ExitStatus),
    TimedOut,
    Failed(String),
}

impl NvmeCliChannel {
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }

    pub fn build_args(&self, command: &EncodedCommand, deadline: Duration, input_file: Option<&str>) -> Vec<String> {
        let f = &command.fields;
        let mut args = vec![
            format!("{}-passthru", command.queue.as_str()),
            self.settings.device.clone(),
            format!("--opcode={:#04x}", command.opcode),
            format!("--namespace-id={}", command.namespace),
            format!("--cdw2={}", f.cdw2),
            format!("--cdw3={}", f.cdw3),
            format!("--cdw10={}", f.cdw10),
            format!("--cdw11={}", f.cdw11),
            format!("--cdw12={}", f.cdw12),
            format!("--cdw13={}", f.cdw13),
            format!("--cdw14={}", f.cdw14),
            format!("--cdw15={}", f.cdw15),
            format!("--timeout={}", deadline.as_millis()),
        ];
        if command.data_len > 0 {
            args.push(format!("--data-len={}", command.data_len));
            match (&command.transfer, input_file) {
                (Transfer::Write(_), Some(path)) => {
                    args.push(format!("--input-file={path}"));
                    args.push("-w".to_string());
                }
                _ => args.push("-r".to_string()),
            }
        }
        args
    }

    /// Polls the child until it exits or `limit` passes. On expiry the child
    /// is killed and reaped with a second bounded wait; a child that survives
    /// that too is abandoned.
    fn wait_with_deadline(&self, mut child: Child, limit: Duration) -> WaitResult {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return WaitResult::Exited(status),
                Ok(None) if start.elapsed() > limit => break,
                Ok(None) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => return WaitResult::Failed(format!("Error waiting for child: {e}")),
            }
        }

        warn!("Command exceeded {:?}, killing pid {}", limit, child.id());
        if let Err(e) = child.kill() {
            error!("Failed to kill timed-out command: {}", e);
        }
        let grace = Duration::from_millis(self.settings.kill_grace_ms);
        let kill_start = Instant::now();
        while kill_start.elapsed() < grace {
            match child.try_wait() {
                Ok(Some(_)) => return WaitResult::TimedOut,
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(_) => break,
            }
        }
        error!(
            "Command pid {} did not exit within {:?} after kill; abandoning it",
            child.id(),
            grace
        );
        WaitResult::TimedOut
    }
}

impl CommandChannel for NvmeCliChannel {
    fn send(&mut self, command: &EncodedCommand, deadline: Duration) -> ChannelOutcome {
        let mut input_file: Option<tempfile::NamedTempFile> = None;
        if let Transfer::Write(data) = &command.transfer {
            let mut file = match tempfile::NamedTempFile::new() {
                Ok(f) => f,
                Err(e) => return ChannelOutcome::Error(format!("Failed to create temp file: {e}")),
            };
            if let Err(e) = file.write_all(data).and_then(|()| file.flush()) {
                return ChannelOutcome::Error(format!(
                    "Failed to write to temp file {:?}: {}",
                    file.path(),
                    e
                ));
            }
            input_file = Some(file);
        }
        let input_path = input_file
            .as_ref()
            .and_then(|f| f.path().to_str().map(String::from));

        let args = self.build_args(command, deadline, input_path.as_deref());
        debug!("{} {}", self.settings.program, args.join(" "));

        let child = match Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ChannelOutcome::Error(format!(
                    "Failed to spawn {}: {}",
                    self.settings.program, e
                ));
            }
        };

        let limit = deadline + Duration::from_millis(self.settings.margin_ms);
        match self.wait_with_deadline(child, limit) {
            WaitResult::Exited(status) => match status.code() {
                Some(code) => ChannelOutcome::Completed(code),
                None => ChannelOutcome::Error(format!("{} terminated by signal", self.settings.program)),
            },
            WaitResult::TimedOut => ChannelOutcome::Timeout,
            WaitResult::Failed(msg) => ChannelOutcome::Error(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Candidate, Fields, Override};
    use crate::protocol::find_command;

    fn channel(program: &str) -> NvmeCliChannel {
        NvmeCliChannel::new(ChannelSettings {
            program: program.to_string(),
            margin_ms: 0,
            kill_grace_ms: 1000,
            ..ChannelSettings::default()
        })
    }

    fn encoded(name: &str, payload: Vec<u8>) -> EncodedCommand {
        let cmd = find_command(name).expect("known command");
        Candidate::new(cmd, payload, Fields::default()).encode(1)
    }

    #[test]
    fn read_command_arguments() {
        let ch = channel("nvme");
        let mut cand = Candidate::new(
            find_command("Identify").expect("identify"),
            vec![],
            Fields {
                cdw10: 1,
                ..Fields::default()
            },
        );
        cand.overrides.set(Override::Namespace(0xFFFF_FFFF));
        let args = ch.build_args(&cand.encode(1), Duration::from_millis(8000), None);
        assert_eq!(args[0], "admin-passthru");
        assert_eq!(args[1], "/dev/nvme0");
        assert!(args.contains(&"--opcode=0x06".to_string()));
        assert!(args.contains(&"--namespace-id=4294967295".to_string()));
        assert!(args.contains(&"--cdw10=1".to_string()));
        assert!(args.contains(&"--timeout=8000".to_string()));
        assert!(args.contains(&"--data-len=4096".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-r"));
    }

    #[test]
    fn write_command_arguments_reference_input_file() {
        let ch = channel("nvme");
        let args = ch.build_args(
            &encoded("Write", vec![0u8; 512]),
            Duration::from_millis(8000),
            Some("/tmp/payload"),
        );
        assert_eq!(args[0], "io-passthru");
        assert!(args.contains(&"--data-len=512".to_string()));
        assert!(args.contains(&"--input-file=/tmp/payload".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-w"));
    }

    #[test]
    fn flush_has_no_transfer_arguments() {
        let ch = channel("nvme");
        let args = ch.build_args(&encoded("Flush", vec![]), Duration::from_millis(30000), None);
        assert!(!args.iter().any(|a| a.starts_with("--data-len")));
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_is_reported() {
        let mut ch = channel("false");
        let outcome = ch.send(&encoded("Identify", vec![]), Duration::from_secs(5));
        assert_eq!(outcome, ChannelOutcome::Completed(1));
    }

    #[cfg(unix)]
    #[test]
    fn missing_program_is_a_channel_error() {
        let mut ch = channel("/nonexistent/nvme-binary");
        let outcome = ch.send(&encoded("Identify", vec![]), Duration::from_secs(1));
        assert!(matches!(outcome, ChannelOutcome::Error(_)));
    }

    #[cfg(unix)]
    #[test]
    fn slow_child_is_killed_after_limit() {
        let ch = channel("unused");
        let child = Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn sleep");
        let started = Instant::now();
        let result = ch.wait_with_deadline(child, Duration::from_millis(100));
        assert!(matches!(result, WaitResult::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
