use serde::{Deserialize, Serialize};
use std::fmt;

/// Submission queue a command is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandQueue {
    Admin,
    Io,
}

impl CommandQueue {
    pub fn swapped(self) -> Self {
        match self {
            CommandQueue::Admin => CommandQueue::Io,
            CommandQueue::Io => CommandQueue::Admin,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandQueue::Admin => "admin",
            CommandQueue::Io => "io",
        }
    }

    /// Lowest opcode of the vendor-specific range for this queue.
    pub fn vendor_range_start(self) -> u8 {
        match self {
            CommandQueue::Admin => 0xC0,
            CommandQueue::Io => 0x80,
        }
    }
}

/// Deadline class of a command. Slow or destructive commands get longer deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutGroup {
    Command,
    Format,
    Sanitize,
    FwCommit,
    Telemetry,
    Dsm,
    Flush,
}

/// Static description of one injectable command type.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub opcode: u8,
    pub queue: CommandQueue,
    pub needs_namespace: bool,
    pub needs_data: bool,
    pub timeout_group: TimeoutGroup,
}

const fn command(
    name: &'static str,
    opcode: u8,
    queue: CommandQueue,
    needs_namespace: bool,
    needs_data: bool,
    timeout_group: TimeoutGroup,
) -> CommandSpec {
    CommandSpec {
        name,
        opcode,
        queue,
        needs_namespace,
        needs_data,
        timeout_group,
    }
}

/// Read-only and fast commands, enabled when no explicit command list is configured.
pub static DEFAULT_COMMANDS: &[CommandSpec] = &[
    command("Identify", 0x06, CommandQueue::Admin, true, false, TimeoutGroup::Command),
    command("GetLogPage", 0x02, CommandQueue::Admin, true, false, TimeoutGroup::Command),
    command("GetFeatures", 0x0A, CommandQueue::Admin, true, false, TimeoutGroup::Command),
    command("Read", 0x02, CommandQueue::Io, true, false, TimeoutGroup::Command),
    command("Write", 0x01, CommandQueue::Io, true, true, TimeoutGroup::Command),
];

/// Destructive or slow commands, only enabled on request.
pub static EXTENDED_COMMANDS: &[CommandSpec] = &[
    command("SetFeatures", 0x09, CommandQueue::Admin, true, true, TimeoutGroup::Command),
    command("FWDownload", 0x11, CommandQueue::Admin, true, true, TimeoutGroup::Command),
    command("FWCommit", 0x10, CommandQueue::Admin, true, true, TimeoutGroup::FwCommit),
    command("FormatNVM", 0x80, CommandQueue::Admin, true, true, TimeoutGroup::Format),
    command("Sanitize", 0x84, CommandQueue::Admin, false, true, TimeoutGroup::Sanitize),
    command(
        "TelemetryHostInitiated",
        0x02,
        CommandQueue::Admin,
        true,
        false,
        TimeoutGroup::Telemetry,
    ),
    command("Flush", 0x00, CommandQueue::Io, true, false, TimeoutGroup::Flush),
    command("DatasetManagement", 0x09, CommandQueue::Io, true, true, TimeoutGroup::Dsm),
];

pub fn all_commands() -> impl Iterator<Item = &'static CommandSpec> {
    DEFAULT_COMMANDS.iter().chain(EXTENDED_COMMANDS.iter())
}

pub fn find_command(name: &str) -> Option<&'static CommandSpec> {
    all_commands().find(|c| c.name == name)
}

/// Resolves the set of commands a session fuzzes.
///
/// An explicit name list wins, then `all`, then the default safe set.
/// Unknown names are ignored.
pub fn enabled_commands(names: &[String], all: bool) -> Vec<&'static CommandSpec> {
    if !names.is_empty() {
        all_commands()
            .filter(|c| names.iter().any(|n| n == c.name))
            .collect()
    } else if all {
        all_commands().collect()
    } else {
        DEFAULT_COMMANDS.iter().collect()
    }
}

/// Name under which an executed command is tracked in statistics and artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandLabel {
    Known(&'static str),
    Unknown(u8),
}

impl fmt::Display for CommandLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLabel::Known(name) => f.write_str(name),
            CommandLabel::Unknown(opcode) => write!(f, "unknown_op0x{opcode:02X}"),
        }
    }
}

/// Reverse lookup of `(opcode, queue)` against the command table.
///
/// The first table entry wins, so GetLogPage shadows TelemetryHostInitiated.
pub fn label_for(opcode: u8, queue: CommandQueue) -> CommandLabel {
    all_commands()
        .find(|c| c.opcode == opcode && c.queue == queue)
        .map_or(CommandLabel::Unknown(opcode), |c| CommandLabel::Known(c.name))
}

/// Well-formed parameter combination for one command, used as a default seed.
#[derive(Debug, Clone, Copy)]
pub struct SeedTemplate {
    pub command: &'static str,
    pub description: &'static str,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub payload: PayloadTemplate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTemplate {
    Empty,
    Fill { byte: u8, len: usize },
    /// One deallocate range: context attributes, block count, starting LBA.
    DsmRange { blocks: u32 },
}

impl PayloadTemplate {
    pub fn render(self) -> Vec<u8> {
        match self {
            PayloadTemplate::Empty => Vec::new(),
            PayloadTemplate::Fill { byte, len } => vec![byte; len],
            PayloadTemplate::DsmRange { blocks } => {
                let mut out = Vec::with_capacity(20);
                for word in [0u32, 0, 0, 0, blocks] {
                    out.extend_from_slice(&word.to_le_bytes());
                }
                out
            }
        }
    }
}

const fn tmpl(command: &'static str, description: &'static str, cdw10: u32) -> SeedTemplate {
    SeedTemplate {
        command,
        description,
        cdw10,
        cdw11: 0,
        cdw12: 0,
        payload: PayloadTemplate::Empty,
    }
}

pub static SEED_TEMPLATES: &[SeedTemplate] = &[
    tmpl("Identify", "Identify Controller", 0x01),
    tmpl("Identify", "Identify Namespace", 0x00),
    tmpl("Identify", "Active NS ID list", 0x02),
    tmpl("Identify", "NS Identification Descriptor list", 0x03),
    tmpl("GetLogPage", "Error Information Log (64B)", (0x0F << 16) | 0x01),
    tmpl("GetLogPage", "SMART / Health Log (512B)", (0x7F << 16) | 0x02),
    tmpl("GetLogPage", "Firmware Slot Info Log (512B)", (0x7F << 16) | 0x03),
    tmpl("GetLogPage", "Commands Supported and Effects Log", (0x1FF << 16) | 0x05),
    tmpl("GetLogPage", "Device Self-test Log (564B)", (0x8C << 16) | 0x06),
    tmpl("GetFeatures", "Arbitration", 0x01),
    tmpl("GetFeatures", "Power Management", 0x02),
    tmpl("GetFeatures", "Temperature Threshold", 0x04),
    tmpl("GetFeatures", "Error Recovery", 0x05),
    tmpl("GetFeatures", "Volatile Write Cache", 0x06),
    tmpl("GetFeatures", "Number of Queues", 0x07),
    tmpl("GetFeatures", "Interrupt Coalescing", 0x08),
    tmpl("GetFeatures", "Interrupt Vector Configuration", 0x09),
    tmpl("GetFeatures", "Write Atomicity Normal", 0x0A),
    tmpl("GetFeatures", "Async Event Configuration", 0x0B),
    tmpl("Read", "Read LBA 0, 1 block", 0),
    tmpl("Read", "Read LBA 1, 1 block", 1),
    SeedTemplate {
        cdw12: 7,
        ..tmpl("Read", "Read LBA 0, 8 blocks", 0)
    },
    tmpl("Read", "Read LBA 1000, 1 block", 1000),
    SeedTemplate {
        payload: PayloadTemplate::Fill { byte: 0x00, len: 512 },
        ..tmpl("Write", "Write LBA 0, 1 block zeros", 0)
    },
    SeedTemplate {
        payload: PayloadTemplate::Fill { byte: 0xAA, len: 512 },
        ..tmpl("Write", "Write LBA 0, 1 block pattern", 0)
    },
    SeedTemplate {
        payload: PayloadTemplate::Fill { byte: 0x00, len: 512 },
        ..tmpl("Write", "Write LBA 1000, 1 block", 1000)
    },
    SeedTemplate {
        cdw11: 0x0001_0001,
        ..tmpl("SetFeatures", "Set Number of Queues (1 SQ + 1 CQ)", 0x07)
    },
    SeedTemplate {
        payload: PayloadTemplate::Fill { byte: 0x00, len: 1024 },
        ..tmpl("FWDownload", "FW Download offset=0, 1KB", 0xFF)
    },
    tmpl("FWCommit", "Commit Action 1, Slot 0", 0x01),
    tmpl("FWCommit", "Commit Action 1, Slot 1", 0x09),
    tmpl("FormatNVM", "Format LBAF 0, no secure erase", 0x00),
    tmpl("Sanitize", "Block Erase", 0x01),
    tmpl("Sanitize", "Overwrite", 0x02),
    tmpl("Sanitize", "Crypto Erase", 0x04),
    tmpl("TelemetryHostInitiated", "Telemetry Host-Initiated Log", (0x1FF << 16) | 0x07),
    tmpl("Flush", "Flush (no parameters)", 0),
    SeedTemplate {
        cdw11: 0x04,
        payload: PayloadTemplate::DsmRange { blocks: 8 },
        ..tmpl("DatasetManagement", "TRIM LBA 0, 8 blocks", 0)
    },
];

pub fn templates_for(name: &str) -> impl Iterator<Item = &'static SeedTemplate> + '_ {
    SEED_TEMPLATES.iter().filter(move |t| t.command == name)
}
