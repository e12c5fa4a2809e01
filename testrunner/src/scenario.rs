//! Scenario files: a population of simulated targets and a script of host
//! and bus events, followed by the completions the script should produce.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use spc_core::scsi::command::{Command, CommandId};
use spc_core::scsi::{HostByte, ScsiDevice};
use spc_core::sim::disk::SimDisk;
use spc_core::sim::{SimSpc, TargetConfig, pump};
use spc_core::spc::{EhResult, SpcError, SpcHost, SpcPlatformData};
use spc_core::types::{Lun, ScsiId};

/// Disk size when a target does not specify one
pub const DEFAULT_BLOCKS: usize = 64;

fn default_blocks() -> usize {
    DEFAULT_BLOCKS
}

fn eh_success() -> EhResult {
    EhResult::Success
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub platform: SpcPlatformData,
    pub targets: Vec<TargetSetup>,
    pub steps: Vec<Step>,
}

/// A simulated disk on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSetup {
    pub id: ScsiId,
    #[serde(default = "default_blocks")]
    pub blocks: usize,
    #[serde(default)]
    pub config: TargetConfig,
}

/// Data out segment, `len` bytes of `byte`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub len: usize,
    pub byte: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedCommand {
    pub id: CommandId,
    pub target: ScsiId,
    #[serde(default)]
    pub lun: Lun,
    #[serde(default)]
    pub soft_reset: bool,
    pub cdb: Vec<u8>,
    /// Segment sizes of the data in buffer
    #[serde(default)]
    pub data_in: Vec<usize>,
    #[serde(default)]
    pub data_out: Vec<Fill>,
    #[serde(default)]
    pub expect: Expect,
}

/// Expected completion of a command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Expect {
    pub host: HostByte,
    pub status: Option<u8>,
    /// Leading bytes of the data buffer after completion
    pub data_prefix: Option<Vec<u8>>,
    pub resid: Option<usize>,
    /// Sense key from the automatic REQUEST SENSE
    pub sense_key: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Hand a command to the adapter
    Queue(ScriptedCommand),
    /// Deliver interrupts until the bus settles
    Pump,
    /// Let a target with a disconnected nexus reselect
    Reselect(ScsiId),
    /// Keep targets from reselecting on their own
    HoldReselection(bool),
    /// Another device pulses RST
    ResetIn,
    Abort {
        id: CommandId,
    },
    DeviceReset {
        id: CommandId,
        #[serde(default = "eh_success")]
        expect: EhResult,
    },
    BusReset,
    HostReset,
}

/// What happened while running a scenario
#[derive(Debug, Default)]
pub struct Outcome {
    pub interrupts: usize,
    pub executed: Vec<Vec<u8>>,
    pub failures: Vec<String>,
}

impl ScriptedCommand {
    fn build(&self, done: &Arc<Mutex<Vec<Command>>>) -> Result<Command, SpcError> {
        let device = ScsiDevice::new(self.target, self.lun).with_soft_reset(self.soft_reset);
        let mut cmd = Command::new(self.id, device, &self.cdb)?;
        if !self.data_out.is_empty() {
            cmd = cmd.with_data_out(self.data_out.iter().map(|f| vec![f.byte; f.len]).collect());
        } else if !self.data_in.is_empty() {
            cmd = cmd.with_data_in(self.data_in.iter().map(|&len| vec![0; len]).collect());
        }

        let done = Arc::clone(done);
        Ok(cmd.with_done(move |c| {
            done.lock().unwrap_or_else(PoisonError::into_inner).push(c);
        }))
    }
}

impl Expect {
    fn check(&self, cmd: &Command, failures: &mut Vec<String>) {
        let id = cmd.id();
        let result = cmd.result();

        if result.host_byte() != Some(self.host) {
            failures.push(format!("Command {}: expected {:?}, got {}", id, self.host, result));
        }
        if let Some(status) = self.status.filter(|&s| s != result.status()) {
            failures.push(format!(
                "Command {}: expected status {:02X}, got {:02X}",
                id,
                status,
                result.status()
            ));
        }
        if let Some(prefix) = &self.data_prefix {
            if !cmd.data_flat().starts_with(prefix) {
                failures.push(format!("Command {}: data mismatch", id));
            }
        }
        if let Some(resid) = self.resid.filter(|&r| r != cmd.resid()) {
            failures.push(format!(
                "Command {}: expected residual {}, got {}",
                id,
                resid,
                cmd.resid()
            ));
        }
        if let Some(key) = self.sense_key {
            let got = cmd.sense().get(2).map(|k| k & 0x0F);
            if got != Some(key) {
                failures.push(format!(
                    "Command {}: expected sense key {:02X}, got {:02X?}",
                    id, key, got
                ));
            }
        }
    }
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).with_context(|| format!("Opening {}", path.display()))?;
        let scenario: Self = serde_json::from_reader(file)
            .with_context(|| format!("Parsing {}", path.display()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = vec![];
        for step in &self.steps {
            if let Step::Queue(entry) = step {
                if !entry.data_in.is_empty() && !entry.data_out.is_empty() {
                    bail!("Command {} has data in both directions", entry.id);
                }
                ids.push(entry.id);
            }
        }
        if let Some(id) = ids.iter().duplicates().next() {
            bail!("Command ID {} used more than once", id);
        }
        Ok(())
    }

    /// Runs the script. Errors are reserved for broken scenarios, unmet
    /// expectations end up in [Outcome::failures].
    pub fn run(&self) -> Result<Outcome> {
        let sim = SimSpc::new();
        for target in &self.targets {
            sim.attach(target.id, SimDisk::new(target.blocks), target.config)?;
        }
        let host = SpcHost::probe(sim.clone(), self.platform.clone())?;

        let done = Arc::new(Mutex::new(vec![]));
        let mut expected = BTreeMap::new();
        let mut outcome = Outcome::default();

        for (idx, step) in self.steps.iter().enumerate() {
            log::debug!("Step {}: {:?}", idx, step);
            match step {
                Step::Queue(entry) => match entry.build(&done) {
                    Ok(cmd) => match host.queue_command(cmd) {
                        Ok(()) => {
                            expected.insert(entry.id, entry.expect.clone());
                        }
                        Err(e) => outcome.failures.push(format!("Step {}: {}", idx, e)),
                    },
                    Err(e) => outcome.failures.push(format!("Step {}: {}", idx, e)),
                },
                Step::Pump => outcome.interrupts += pump(&host),
                Step::Reselect(id) => {
                    if !sim.reselect(*id) {
                        outcome
                            .failures
                            .push(format!("Step {}: target {} cannot reselect", idx, id));
                    }
                }
                Step::HoldReselection(hold) => sim.hold_reselection(*hold),
                Step::ResetIn => sim.assert_reset(),
                Step::Abort { id } => {
                    check_eh(&mut outcome, idx, host.abort(*id), EhResult::Success);
                }
                Step::DeviceReset { id, expect } => {
                    let (result, interrupts) = device_reset(&host, *id)?;
                    outcome.interrupts += interrupts;
                    check_eh(&mut outcome, idx, result, *expect);
                }
                Step::BusReset => {
                    check_eh(&mut outcome, idx, host.bus_reset(), EhResult::Success);
                }
                Step::HostReset => {
                    check_eh(&mut outcome, idx, host.host_reset(), EhResult::Success);
                }
            }
        }
        outcome.interrupts += pump(&host);

        if host.outstanding() != 0 {
            outcome.failures.push(format!(
                "{} commands still outstanding:\n{}",
                host.outstanding(),
                host.dump()
            ));
        }

        let completed = std::mem::take(&mut *done.lock().unwrap_or_else(PoisonError::into_inner));
        if let Some(id) = completed.iter().map(Command::id).duplicates().next() {
            outcome.failures.push(format!("Command {} completed more than once", id));
        }
        for cmd in &completed {
            match expected.remove(&cmd.id()) {
                Some(expect) => expect.check(cmd, &mut outcome.failures),
                None => log::debug!("Command {}: {}", cmd.id(), cmd.result()),
            }
        }
        if !expected.is_empty() {
            outcome.failures.push(format!(
                "Commands never completed: {}",
                expected.keys().join(", ")
            ));
        }

        outcome.executed = sim.executed();
        Ok(outcome)
    }
}

fn check_eh(outcome: &mut Outcome, idx: usize, result: EhResult, expect: EhResult) {
    if result != expect {
        outcome
            .failures
            .push(format!("Step {}: expected {:?}, got {:?}", idx, expect, result));
    }
}

/// Device reset blocks until the reset went out, keep the bus moving meanwhile
fn device_reset(host: &SpcHost<SimSpc>, id: CommandId) -> Result<(EhResult, usize)> {
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        let pumper = s.spawn(|| {
            let mut interrupts = 0;
            while !stop.load(Ordering::Acquire) {
                interrupts += pump(host);
                std::thread::yield_now();
            }
            interrupts
        });
        let result = host.device_reset(id);
        stop.store(true, Ordering::Release);
        let interrupts = pumper
            .join()
            .map_err(|_| anyhow!("Bus pump thread panicked"))?;
        Ok((result, interrupts))
    })
}
