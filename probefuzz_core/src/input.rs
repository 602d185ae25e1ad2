use crate::protocol::{CommandLabel, CommandQueue, CommandSpec, TimeoutGroup, label_for};
use serde::{Deserialize, Serialize};

/// Upper bound on any declared transfer length.
pub const MAX_DATA_LEN: u32 = 2 * 1024 * 1024;

/// Byte view of a fuzz input, used for hashing and persistence.
pub trait Input: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn as_bytes(&self) -> &[u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
}

/// One of the eight numeric command dwords the mutator treats as a structured field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldId {
    Cdw2,
    Cdw3,
    Cdw10,
    Cdw11,
    Cdw12,
    Cdw13,
    Cdw14,
    Cdw15,
}

impl FieldId {
    pub const ALL: [FieldId; 8] = [
        FieldId::Cdw2,
        FieldId::Cdw3,
        FieldId::Cdw10,
        FieldId::Cdw11,
        FieldId::Cdw12,
        FieldId::Cdw13,
        FieldId::Cdw14,
        FieldId::Cdw15,
    ];

    /// Command-specific parameter dwords, enumerated by the deterministic stage.
    pub const PARAMETERS: [FieldId; 6] = [
        FieldId::Cdw10,
        FieldId::Cdw11,
        FieldId::Cdw12,
        FieldId::Cdw13,
        FieldId::Cdw14,
        FieldId::Cdw15,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FieldId::Cdw2 => "cdw2",
            FieldId::Cdw3 => "cdw3",
            FieldId::Cdw10 => "cdw10",
            FieldId::Cdw11 => "cdw11",
            FieldId::Cdw12 => "cdw12",
            FieldId::Cdw13 => "cdw13",
            FieldId::Cdw14 => "cdw14",
            FieldId::Cdw15 => "cdw15",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fields {
    pub cdw2: u32,
    pub cdw3: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl Fields {
    pub fn get(&self, id: FieldId) -> u32 {
        match id {
            FieldId::Cdw2 => self.cdw2,
            FieldId::Cdw3 => self.cdw3,
            FieldId::Cdw10 => self.cdw10,
            FieldId::Cdw11 => self.cdw11,
            FieldId::Cdw12 => self.cdw12,
            FieldId::Cdw13 => self.cdw13,
            FieldId::Cdw14 => self.cdw14,
            FieldId::Cdw15 => self.cdw15,
        }
    }

    pub fn set(&mut self, id: FieldId, value: u32) {
        let slot = match id {
            FieldId::Cdw2 => &mut self.cdw2,
            FieldId::Cdw3 => &mut self.cdw3,
            FieldId::Cdw10 => &mut self.cdw10,
            FieldId::Cdw11 => &mut self.cdw11,
            FieldId::Cdw12 => &mut self.cdw12,
            FieldId::Cdw13 => &mut self.cdw13,
            FieldId::Cdw14 => &mut self.cdw14,
            FieldId::Cdw15 => &mut self.cdw15,
        };
        *slot = value;
    }
}

/// A structural reinterpretation of the command carried by a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum Override {
    Opcode(u8),
    Namespace(u32),
    Queue(CommandQueue),
    DataLength(u32),
}

impl Override {
    fn same_kind(&self, other: &Override) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// At most one [`Override`] of each kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Overrides(Vec<Override>);

impl Overrides {
    pub fn set(&mut self, value: Override) {
        match self.0.iter_mut().find(|o| o.same_kind(&value)) {
            Some(slot) => *slot = value,
            None => self.0.push(value),
        }
    }

    pub fn clear_opcode(&mut self) {
        self.0.retain(|o| !matches!(o, Override::Opcode(_)));
    }

    pub fn opcode(&self) -> Option<u8> {
        self.0.iter().find_map(|o| match o {
            Override::Opcode(v) => Some(*v),
            _ => None,
        })
    }

    pub fn namespace(&self) -> Option<u32> {
        self.0.iter().find_map(|o| match o {
            Override::Namespace(v) => Some(*v),
            _ => None,
        })
    }

    pub fn queue(&self) -> Option<CommandQueue> {
        self.0.iter().find_map(|o| match o {
            Override::Queue(v) => Some(*v),
            _ => None,
        })
    }

    pub fn data_length(&self) -> Option<u32> {
        self.0.iter().find_map(|o| match o {
            Override::DataLength(v) => Some(*v),
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Override> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A fully specified command ready to be encoded: payload, dwords and overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub command: &'static CommandSpec,
    pub payload: Vec<u8>,
    pub fields: Fields,
    pub overrides: Overrides,
}

impl Input for Candidate {
    fn as_bytes(&self) -> &[u8] {
        &self.payload
    }
    fn len(&self) -> usize {
        self.payload.len()
    }
    fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    None,
    /// Controller-to-host transfer into a buffer of the declared length.
    Read,
    /// Host-to-controller transfer of exactly the declared length.
    Write(Vec<u8>),
}

/// Wire-level view of a [`Candidate`] after overrides and length rules are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    pub label: CommandLabel,
    pub queue: CommandQueue,
    pub opcode: u8,
    pub namespace: u32,
    pub fields: Fields,
    pub data_len: u32,
    pub transfer: Transfer,
    pub timeout_group: TimeoutGroup,
}

impl Candidate {
    pub fn new(command: &'static CommandSpec, payload: Vec<u8>, fields: Fields) -> Self {
        Self {
            command,
            payload,
            fields,
            overrides: Overrides::default(),
        }
    }

    pub fn effective_opcode(&self) -> u8 {
        self.overrides.opcode().unwrap_or(self.command.opcode)
    }

    pub fn effective_queue(&self) -> CommandQueue {
        self.overrides.queue().unwrap_or(self.command.queue)
    }

    pub fn label(&self) -> CommandLabel {
        match self.overrides.opcode() {
            Some(opcode) => label_for(opcode, self.effective_queue()),
            None => CommandLabel::Known(self.command.name),
        }
    }

    fn derived_data_len(&self) -> u32 {
        let cmd = self.command;
        let len = if cmd.needs_data && !self.payload.is_empty() {
            u32::try_from(self.payload.len()).unwrap_or(MAX_DATA_LEN)
        } else if cmd.queue == CommandQueue::Io
            && cmd.name != "Flush"
            && cmd.name != "DatasetManagement"
        {
            let nlb = self.fields.cdw12 & 0xFFFF;
            ((nlb + 1) * 512).max(512)
        } else if cmd.name == "GetLogPage" {
            let numdl = (self.fields.cdw10 >> 16) & 0x7FF;
            ((numdl + 1) * 4).max(4)
        } else if matches!(cmd.name, "Identify" | "GetFeatures" | "TelemetryHostInitiated") {
            4096
        } else {
            0
        };
        len.min(MAX_DATA_LEN)
    }

    /// Applies overrides and transfer-length rules.
    ///
    /// `default_namespace` is used for namespace-scoped commands without a
    /// namespace override; other commands address namespace 0.
    pub fn encode(&self, default_namespace: u32) -> EncodedCommand {
        let namespace = self.overrides.namespace().unwrap_or(if self.command.needs_namespace {
            default_namespace
        } else {
            0
        });
        let writes = self.command.needs_data && !self.payload.is_empty();
        let data_len = match self.overrides.data_length() {
            Some(len) => len.min(MAX_DATA_LEN),
            None => self.derived_data_len(),
        };
        let transfer = if data_len == 0 {
            Transfer::None
        } else if writes {
            let mut buf = self.payload.clone();
            buf.resize(data_len as usize, 0);
            Transfer::Write(buf)
        } else {
            Transfer::Read
        };
        EncodedCommand {
            label: self.label(),
            queue: self.effective_queue(),
            opcode: self.effective_opcode(),
            namespace,
            fields: self.fields,
            data_len,
            transfer,
            timeout_group: self.command.timeout_group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::find_command;

    fn cmd(name: &str) -> &'static CommandSpec {
        find_command(name).expect("known command")
    }

    #[test]
    fn candidate_bytes_are_the_payload() {
        let data = Candidate::new(cmd("Write"), vec![1, 2, 3], Fields::default());
        let empty = Candidate::new(cmd("Flush"), vec![], Fields::default());
        assert_eq!(data.as_bytes(), &[1, 2, 3]);
        assert_eq!(Input::len(&data), 3);
        assert!(!Input::is_empty(&data));
        assert!(Input::is_empty(&empty));
    }

    #[test]
    fn overrides_hold_one_value_per_kind() {
        let mut ovr = Overrides::default();
        ovr.set(Override::Opcode(0xC1));
        ovr.set(Override::Namespace(0));
        ovr.set(Override::Opcode(0xC2));
        assert_eq!(ovr.iter().count(), 2);
        assert_eq!(ovr.opcode(), Some(0xC2));
        assert_eq!(ovr.namespace(), Some(0));
        ovr.clear_opcode();
        assert_eq!(ovr.opcode(), None);
        assert_eq!(ovr.queue(), None);
    }

    #[test]
    fn read_length_follows_block_count() {
        let fields = Fields {
            cdw12: 7,
            ..Fields::default()
        };
        let encoded = Candidate::new(cmd("Read"), vec![], fields).encode(1);
        assert_eq!(encoded.data_len, 8 * 512);
        assert_eq!(encoded.transfer, Transfer::Read);
        assert_eq!(encoded.namespace, 1);
    }

    #[test]
    fn get_log_page_length_follows_numdl() {
        let fields = Fields {
            cdw10: (0x7F << 16) | 0x02,
            ..Fields::default()
        };
        let encoded = Candidate::new(cmd("GetLogPage"), vec![], fields).encode(1);
        assert_eq!(encoded.data_len, 512);
    }

    #[test]
    fn write_payload_is_padded_to_length_override() {
        let mut cand = Candidate::new(cmd("Write"), vec![0xAB; 16], Fields::default());
        assert_eq!(cand.encode(1).data_len, 16);
        cand.overrides.set(Override::DataLength(64));
        let encoded = cand.encode(1);
        assert_eq!(encoded.data_len, 64);
        match encoded.transfer {
            Transfer::Write(buf) => {
                assert_eq!(buf.len(), 64);
                assert_eq!(&buf[..16], &[0xAB; 16]);
                assert!(buf[16..].iter().all(|b| *b == 0));
            }
            other => panic!("expected write transfer, got {other:?}"),
        }
    }

    #[test]
    fn length_override_is_capped() {
        let mut cand = Candidate::new(cmd("Identify"), vec![], Fields::default());
        cand.overrides.set(Override::DataLength(u32::MAX));
        assert_eq!(cand.encode(1).data_len, MAX_DATA_LEN);
    }

    #[test]
    fn opcode_override_relabels_command() {
        let mut cand = Candidate::new(cmd("Identify"), vec![], Fields::default());
        assert_eq!(cand.label(), CommandLabel::Known("Identify"));
        cand.overrides.set(Override::Opcode(0x02));
        cand.overrides.set(Override::Queue(CommandQueue::Io));
        assert_eq!(cand.label(), CommandLabel::Known("Read"));
        cand.overrides.set(Override::Opcode(0xEE));
        assert_eq!(cand.label(), CommandLabel::Unknown(0xEE));
        let encoded = cand.encode(1);
        assert_eq!(encoded.opcode, 0xEE);
        assert_eq!(encoded.queue, CommandQueue::Io);
    }

    #[test]
    fn sanitize_is_not_namespace_scoped() {
        let cand = Candidate::new(cmd("Sanitize"), vec![], Fields::default());
        assert_eq!(cand.encode(1).namespace, 0);
        assert_eq!(cand.encode(1).transfer, Transfer::None);
    }
}
