//! Scripted collaborators for sampler and orchestrator tests.

use crate::channel::{ChannelOutcome, CommandChannel};
use crate::coverage::Address;
use crate::crash::ExternalLog;
use crate::input::EncodedCommand;
use crate::probe::{ProbeError, TargetProbe};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Shared queue of program-counter reads. Tests push to it while a probe
/// built from it is owned by the sampler.
#[derive(Clone, Default)]
pub struct ProbeScript {
    queue: Arc<Mutex<VecDeque<Result<Address, ProbeError>>>>,
    halts: Arc<AtomicUsize>,
    resumes: Arc<AtomicUsize>,
}

impl ProbeScript {
    pub fn push(&self, read: Result<Address, ProbeError>) {
        self.queue.lock().expect("script lock").push_back(read);
    }

    pub fn push_pcs(&self, pcs: &[Address]) {
        let mut queue = self.queue.lock().expect("script lock");
        queue.extend(pcs.iter().map(|pc| Ok(*pc)));
    }

    pub fn is_drained(&self) -> bool {
        self.queue.lock().expect("script lock").is_empty()
    }

    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while !self.is_drained() {
            if started.elapsed() > timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn probe(&self) -> ScriptedProbe {
        ScriptedProbe {
            script: self.clone(),
            current: None,
        }
    }
}

/// Serves one scripted read per halt. An empty script makes `halt` fail
/// transiently, as a busy probe would.
pub struct ScriptedProbe {
    script: ProbeScript,
    current: Option<Result<Address, ProbeError>>,
}

impl TargetProbe for ScriptedProbe {
    fn halt(&mut self) -> Result<(), ProbeError> {
        self.script.halts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.queue.lock().expect("script lock").pop_front();
        match next {
            Some(read) => {
                self.current = Some(read);
                Ok(())
            }
            None => Err(ProbeError::Transient("script exhausted".into())),
        }
    }

    fn read_program_counter(&mut self) -> Result<Address, ProbeError> {
        self.current
            .take()
            .unwrap_or_else(|| Err(ProbeError::Transient("read without halt".into())))
    }

    fn resume(&mut self) -> Result<(), ProbeError> {
        self.script.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One scripted command: the pcs the target "executes" while it is in
/// flight, and what the channel reports afterwards.
pub struct Step {
    pub pcs: Vec<Address>,
    pub outcome: ChannelOutcome,
}

impl Step {
    pub fn ok(pcs: &[Address]) -> Self {
        Self {
            pcs: pcs.to_vec(),
            outcome: ChannelOutcome::Completed(0),
        }
    }

    pub fn with(pcs: &[Address], outcome: ChannelOutcome) -> Self {
        Self {
            pcs: pcs.to_vec(),
            outcome,
        }
    }
}

/// Feeds each send's pcs to the probe script and waits until the running
/// window has consumed them. Unscripted sends complete with status 0.
pub struct ScriptedChannel {
    script: ProbeScript,
    steps: VecDeque<Step>,
    sent: Arc<Mutex<Vec<EncodedCommand>>>,
}

impl ScriptedChannel {
    pub fn new(script: ProbeScript, steps: Vec<Step>) -> Self {
        Self {
            script,
            steps: steps.into(),
            sent: Arc::default(),
        }
    }

    pub fn sent(&self) -> Arc<Mutex<Vec<EncodedCommand>>> {
        Arc::clone(&self.sent)
    }
}

impl CommandChannel for ScriptedChannel {
    fn send(&mut self, command: &EncodedCommand, _deadline: Duration) -> ChannelOutcome {
        self.sent.lock().expect("sent lock").push(command.clone());
        let step = self.steps.pop_front().unwrap_or_else(|| Step::ok(&[]));
        if !step.pcs.is_empty() {
            self.script.push_pcs(&step.pcs);
            self.script.wait_drained(Duration::from_secs(2));
        }
        step.outcome
    }
}

#[derive(Default)]
pub struct FixedLog(pub String);

impl ExternalLog for FixedLog {
    fn snapshot(&mut self) -> String {
        self.0.clone()
    }
}
