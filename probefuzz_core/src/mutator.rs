use crate::config::MutationSettings;
use crate::input::{Candidate, FieldId, Fields, MAX_DATA_LEN, Override};
use crate::operator_schedule::OperatorSchedule;
use crate::protocol::{CommandSpec, all_commands};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

/// Largest delta used by the arithmetic operators.
pub const ARITH_MAX: u32 = 35;

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];
pub const INTERESTING_16: [i16; 10] = [-32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767];
pub const INTERESTING_32: [i32; 8] = [
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

const ASCII_NUMBERS: [i64; 10] = [
    0,
    1,
    -1,
    255,
    256,
    65535,
    65536,
    0x7FFF_FFFF,
    -2147483648,
    0xFFFF_FFFF,
];

const DATA_LENGTHS: [u32; 7] = [0, 4, 64, 512, 4096, 8192, 65536];

/// Byte-level havoc operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOp {
    BitFlip,
    Interesting8,
    Interesting16,
    Interesting32,
    Arith8,
    Arith16,
    Arith32,
    RandomByte,
    SwapBytes,
    DeleteRange,
    InsertBytes,
    OverwriteBytes,
    Splice,
    ShuffleRange,
    BlockFill,
    AsciiInt,
}

impl ByteOp {
    pub const COUNT: usize = 16;

    pub const ALL: [ByteOp; ByteOp::COUNT] = [
        ByteOp::BitFlip,
        ByteOp::Interesting8,
        ByteOp::Interesting16,
        ByteOp::Interesting32,
        ByteOp::Arith8,
        ByteOp::Arith16,
        ByteOp::Arith32,
        ByteOp::RandomByte,
        ByteOp::SwapBytes,
        ByteOp::DeleteRange,
        ByteOp::InsertBytes,
        ByteOp::OverwriteBytes,
        ByteOp::Splice,
        ByteOp::ShuffleRange,
        ByteOp::BlockFill,
        ByteOp::AsciiInt,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ByteOp::BitFlip => "bitflip",
            ByteOp::Interesting8 => "int8",
            ByteOp::Interesting16 => "int16",
            ByteOp::Interesting32 => "int32",
            ByteOp::Arith8 => "arith8",
            ByteOp::Arith16 => "arith16",
            ByteOp::Arith32 => "arith32",
            ByteOp::RandomByte => "randbyte",
            ByteOp::SwapBytes => "byteswap",
            ByteOp::DeleteRange => "delete",
            ByteOp::InsertBytes => "insert",
            ByteOp::OverwriteBytes => "overwrite",
            ByteOp::Splice => "splice",
            ByteOp::ShuffleRange => "shuffle",
            ByteOp::BlockFill => "blockfill",
            ByteOp::AsciiInt => "asciiint",
        }
    }
}

fn pick<T: Copy, R: Rng + ?Sized>(rng: &mut R, items: &[T]) -> T {
    items[rng.random_range(0..items.len())]
}

fn interesting_16<R: Rng + ?Sized>(rng: &mut R) -> u16 {
    let i = rng.random_range(0..INTERESTING_8.len() + INTERESTING_16.len());
    match INTERESTING_8.get(i) {
        Some(v) => i16::from(*v) as u16,
        None => INTERESTING_16[i - INTERESTING_8.len()] as u16,
    }
}

/// Any value from the 8, 16 and 32-bit tables, sign-extended to 32 bits.
fn interesting_32<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    let total = INTERESTING_8.len() + INTERESTING_16.len() + INTERESTING_32.len();
    let i = rng.random_range(0..total);
    if i < INTERESTING_8.len() {
        i32::from(INTERESTING_8[i]) as u32
    } else if i < INTERESTING_8.len() + INTERESTING_16.len() {
        i32::from(INTERESTING_16[i - INTERESTING_8.len()]) as u32
    } else {
        INTERESTING_32[i - INTERESTING_8.len() - INTERESTING_16.len()] as u32
    }
}

fn delta<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.random_range(1..=ARITH_MAX)
}

/// Applies one havoc operator in place. Operators whose size precondition
/// is not met leave `buf` untouched.
pub fn apply_byte_op<R: Rng + ?Sized>(op: ByteOp, buf: &mut Vec<u8>, donor: Option<&[u8]>, rng: &mut R) {
    let len = buf.len();
    if len == 0 {
        return;
    }
    match op {
        ByteOp::BitFlip => {
            let pos = rng.random_range(0..len);
            buf[pos] ^= 1 << rng.random_range(0..8);
        }
        ByteOp::Interesting8 => {
            let pos = rng.random_range(0..len);
            buf[pos] = pick(rng, &INTERESTING_8) as u8;
        }
        ByteOp::Interesting16 if len >= 2 => {
            let pos = rng.random_range(0..=len - 2);
            let v = interesting_16(rng);
            let bytes = if rng.random_bool(0.5) { v.to_le_bytes() } else { v.to_be_bytes() };
            buf[pos..pos + 2].copy_from_slice(&bytes);
        }
        ByteOp::Interesting32 if len >= 4 => {
            let pos = rng.random_range(0..=len - 4);
            let v = interesting_32(rng);
            let bytes = if rng.random_bool(0.5) { v.to_le_bytes() } else { v.to_be_bytes() };
            buf[pos..pos + 4].copy_from_slice(&bytes);
        }
        ByteOp::Arith8 => {
            let pos = rng.random_range(0..len);
            let d = delta(rng) as u8;
            buf[pos] = if rng.random_bool(0.5) { buf[pos].wrapping_add(d) } else { buf[pos].wrapping_sub(d) };
        }
        ByteOp::Arith16 if len >= 2 => {
            let pos = rng.random_range(0..=len - 2);
            let little = rng.random_bool(0.5);
            let raw = [buf[pos], buf[pos + 1]];
            let v = if little { u16::from_le_bytes(raw) } else { u16::from_be_bytes(raw) };
            let d = delta(rng) as u16;
            let v = if rng.random_bool(0.5) { v.wrapping_add(d) } else { v.wrapping_sub(d) };
            let out = if little { v.to_le_bytes() } else { v.to_be_bytes() };
            buf[pos..pos + 2].copy_from_slice(&out);
        }
        ByteOp::Arith32 if len >= 4 => {
            let pos = rng.random_range(0..=len - 4);
            let little = rng.random_bool(0.5);
            let raw = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
            let v = if little { u32::from_le_bytes(raw) } else { u32::from_be_bytes(raw) };
            let d = delta(rng);
            let v = if rng.random_bool(0.5) { v.wrapping_add(d) } else { v.wrapping_sub(d) };
            let out = if little { v.to_le_bytes() } else { v.to_be_bytes() };
            buf[pos..pos + 4].copy_from_slice(&out);
        }
        ByteOp::RandomByte => {
            let pos = rng.random_range(0..len);
            buf[pos] = rng.random();
        }
        ByteOp::SwapBytes if len >= 2 => {
            let a = rng.random_range(0..len);
            let b = rng.random_range(0..len);
            buf.swap(a, b);
        }
        ByteOp::DeleteRange if len > 1 => {
            let del_len = rng.random_range(1..=(len / 4).max(1));
            let pos = rng.random_range(0..=len - del_len);
            buf.drain(pos..pos + del_len);
        }
        ByteOp::InsertBytes => {
            let ins_len = rng.random_range(1..=(len / 4).clamp(1, 128));
            let pos = rng.random_range(0..=len);
            let chunk: Vec<u8> = if rng.random_bool(0.5) && len >= ins_len {
                let src = rng.random_range(0..=len - ins_len);
                buf[src..src + ins_len].to_vec()
            } else {
                (0..ins_len).map(|_| rng.random()).collect()
            };
            buf.splice(pos..pos, chunk);
        }
        ByteOp::OverwriteBytes if len >= 2 => {
            let ow_len = rng.random_range(1..=(len / 4).clamp(1, 128));
            let dst = rng.random_range(0..=len - ow_len);
            if rng.random_bool(0.5) {
                let src = rng.random_range(0..=len - ow_len);
                buf.copy_within(src..src + ow_len, dst);
            } else {
                rng.fill(&mut buf[dst..dst + ow_len]);
            }
        }
        ByteOp::Splice if len >= 4 => {
            let Some(donor) = donor.filter(|d| !d.is_empty()) else {
                return;
            };
            let src = rng.random_range(0..donor.len());
            let copy_len = rng.random_range(1..=(donor.len() - src).min(len));
            let dst = rng.random_range(0..=len - copy_len);
            buf[dst..dst + copy_len].copy_from_slice(&donor[src..src + copy_len]);
        }
        ByteOp::ShuffleRange if len >= 2 => {
            let chunk = rng.random_range(2..=len.min(16));
            let start = rng.random_range(0..=len - chunk);
            buf[start..start + chunk].shuffle(rng);
        }
        ByteOp::BlockFill => {
            let block = rng.random_range(1..=len.min(32));
            let start = rng.random_range(0..=len - block);
            let value = match rng.random_range(0..5) {
                0 => 0x00,
                1 => 0xFF,
                2 => 0x41,
                3 => 0x20,
                _ => rng.random(),
            };
            buf[start..start + block].fill(value);
        }
        ByteOp::AsciiInt if len >= 8 => {
            let pos = rng.random_range(0..=len - 8);
            let number = if rng.random_range(0..=ASCII_NUMBERS.len()) == ASCII_NUMBERS.len() {
                rng.random_range(-1_000_000i64..=1_000_000)
            } else {
                pick(rng, &ASCII_NUMBERS)
            };
            let text = number.to_string();
            let n = text.len().min(len - pos);
            buf[pos..pos + n].copy_from_slice(&text.as_bytes()[..n]);
        }
        _ => {}
    }
}

/// Crossover of two payloads at a random split point. Returns `None` when
/// either side is too short to split.
pub fn splice<R: Rng + ?Sized>(a: &[u8], b: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    let min_len = a.len().min(b.len());
    if min_len < 3 {
        return None;
    }
    let split = rng.random_range(1..min_len - 1);
    let (head, tail) = if rng.random_bool(0.5) { (a, b) } else { (b, a) };
    let mut out = head[..split].to_vec();
    out.extend_from_slice(&tail[split..]);
    Some(out)
}

/// Operators on a single 32-bit command dword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    WalkingBitFlip,
    Arith,
    Interesting,
    Random,
    ReplaceByte,
    ByteOrderSwap,
}

impl FieldOp {
    pub const ALL: [FieldOp; 6] = [
        FieldOp::WalkingBitFlip,
        FieldOp::Arith,
        FieldOp::Interesting,
        FieldOp::Random,
        FieldOp::ReplaceByte,
        FieldOp::ByteOrderSwap,
    ];

    pub fn apply<R: Rng + ?Sized>(self, value: u32, rng: &mut R) -> u32 {
        match self {
            FieldOp::WalkingBitFlip => {
                let mut v = value;
                for _ in 0..rng.random_range(1..=4) {
                    v ^= 1 << rng.random_range(0..32);
                }
                v
            }
            FieldOp::Arith => {
                let d = delta(rng);
                if rng.random_bool(0.5) { value.wrapping_add(d) } else { value.wrapping_sub(d) }
            }
            FieldOp::Interesting => interesting_32(rng),
            FieldOp::Random => rng.random(),
            FieldOp::ReplaceByte => {
                let shift = rng.random_range(0..4) * 8;
                (value & !(0xFF << shift)) | (u32::from(rng.random::<u8>()) << shift)
            }
            FieldOp::ByteOrderSwap => {
                if rng.random_bool(0.5) { value.swap_bytes() } else { value.rotate_left(16) }
            }
        }
    }
}

/// Mutates one to three randomly chosen dwords.
pub fn mutate_fields<R: Rng + ?Sized>(fields: &mut Fields, rng: &mut R) {
    for _ in 0..rng.random_range(1..=3) {
        let id = pick(rng, &FieldId::ALL);
        let op = pick(rng, &FieldOp::ALL);
        fields.set(id, op.apply(fields.get(id), rng));
    }
}

/// How often each structural mutation fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MutationCounters {
    pub splices: u64,
    pub field_mutations: u64,
    pub opcode_overrides: u64,
    pub excluded_opcodes: u64,
    pub namespace_overrides: u64,
    pub queue_swaps: u64,
    pub length_overrides: u64,
    pub oversized_log_requests: u64,
}

/// Produces child candidates from parents.
///
/// The pipeline per call is: optional splice with a donor, stacked havoc
/// operators on the payload, optional dword mutation, then structural
/// overrides (opcode, namespace, queue, data length) each gated by its own
/// probability, and finally the GetLogPage oversized request.
pub struct MutationEngine {
    settings: MutationSettings,
    max_input_len: usize,
    schedule: OperatorSchedule,
    applied: Vec<ByteOp>,
    counters: MutationCounters,
}

impl MutationEngine {
    pub fn new(settings: MutationSettings, max_input_len: usize) -> Self {
        let schedule = OperatorSchedule::new(
            settings.operator_schedule,
            settings.pilot_period,
            settings.core_period,
        );
        Self {
            settings,
            max_input_len,
            schedule,
            applied: Vec::new(),
            counters: MutationCounters::default(),
        }
    }

    pub fn settings(&self) -> &MutationSettings {
        &self.settings
    }

    pub fn schedule(&self) -> &OperatorSchedule {
        &self.schedule
    }

    pub fn counters(&self) -> MutationCounters {
        self.counters
    }

    /// Havoc operators applied by the last [`MutationEngine::mutate`] call.
    pub fn applied_ops(&self) -> &[ByteOp] {
        &self.applied
    }

    pub fn mutate<R: Rng + ?Sized>(&mut self, parent: &Candidate, donor: Option<&Candidate>, rng: &mut R) -> Candidate {
        self.applied.clear();
        let mut child = parent.clone();

        let mut data = parent.payload.clone();
        if let Some(donor) = donor {
            if rng.random_bool(self.settings.splice_probability) {
                if let Some(spliced) = splice(&data, &donor.payload, rng) {
                    data = spliced;
                    self.counters.splices += 1;
                }
            }
        }
        if !data.is_empty() {
            data = self.havoc(data, donor.map(|d| d.payload.as_slice()), rng);
        }
        child.payload = data;

        if rng.random_bool(self.settings.field_probability) {
            mutate_fields(&mut child.fields, rng);
            self.counters.field_mutations += 1;
        }

        self.apply_overrides(&mut child, rng);
        child
    }

    /// Stacks 2^1..=2^7 operators chosen by the operator schedule.
    pub fn havoc<R: Rng + ?Sized>(&mut self, mut buf: Vec<u8>, donor: Option<&[u8]>, rng: &mut R) -> Vec<u8> {
        let stack = 1usize << rng.random_range(1..=7);
        for _ in 0..stack {
            if buf.is_empty() {
                buf.push(0);
            }
            let op = self.schedule.select(rng);
            self.applied.push(op);
            apply_byte_op(op, &mut buf, donor, rng);
            if buf.len() > self.max_input_len * 2 {
                buf.truncate(self.max_input_len);
            }
        }
        buf.truncate(self.max_input_len);
        buf
    }

    fn apply_overrides<R: Rng + ?Sized>(&mut self, child: &mut Candidate, rng: &mut R) {
        let cmd = child.command;

        if rng.random_bool(self.settings.opcode_override_probability) {
            let opcode = self.pick_opcode(cmd, rng);
            if self.settings.excluded_opcodes.contains(&opcode) {
                child.overrides.clear_opcode();
                self.counters.excluded_opcodes += 1;
            } else {
                child.overrides.set(Override::Opcode(opcode));
                self.counters.opcode_overrides += 1;
            }
        }

        if rng.random_bool(self.settings.namespace_override_probability) {
            let nsid = match rng.random_range(0..6) {
                0 => 0,
                1 => 0xFFFF_FFFF,
                2 => 2,
                3 => 0xFFFF_FFFE,
                4 => rng.random_range(2..=0xFFFF),
                _ => rng.random(),
            };
            child.overrides.set(Override::Namespace(nsid));
            self.counters.namespace_overrides += 1;
        }

        if rng.random_bool(self.settings.queue_swap_probability) {
            child.overrides.set(Override::Queue(cmd.queue.swapped()));
            self.counters.queue_swaps += 1;
        }

        if rng.random_bool(self.settings.length_override_probability) {
            let len = if rng.random_range(0..=DATA_LENGTHS.len()) == DATA_LENGTHS.len() {
                rng.random_range(1..=MAX_DATA_LEN)
            } else {
                pick(rng, &DATA_LENGTHS)
            };
            child.overrides.set(Override::DataLength(len));
            self.counters.length_overrides += 1;
        }

        if cmd.name == "GetLogPage" && rng.random_bool(self.settings.oversized_log_probability) {
            let numdl: u32 = match rng.random_range(0..3) {
                0 => 0x7FF,
                1 => 0x3FF,
                _ => rng.random_range(0x100..=0x7FF),
            };
            child.fields.cdw10 = (child.fields.cdw10 & 0xF800_FFFF) | (numdl << 16);
            child.overrides.set(Override::DataLength((numdl + 1) * 4));
            self.counters.oversized_log_requests += 1;
        }
    }

    fn pick_opcode<R: Rng + ?Sized>(&self, cmd: &CommandSpec, rng: &mut R) -> u8 {
        match rng.random_range(0..4) {
            0 => rng.random_range(cmd.queue.vendor_range_start()..=0xFF),
            1 => rng.random(),
            2 => cmd.opcode ^ (1 << rng.random_range(0..8)),
            _ => {
                let others: Vec<u8> = all_commands()
                    .map(|c| c.opcode)
                    .filter(|op| *op != cmd.opcode)
                    .collect();
                if others.is_empty() { cmd.opcode } else { pick(rng, &others) }
            }
        }
    }

    /// Fresh random payload for a random command.
    pub fn random_candidate<R: Rng + ?Sized>(&self, commands: &[&'static CommandSpec], rng: &mut R) -> Option<Candidate> {
        if commands.is_empty() {
            return None;
        }
        let cmd = pick(rng, commands);
        let len = rng.random_range(64..=512).min(self.max_input_len);
        let mut payload = vec![0u8; len];
        rng.fill(payload.as_mut_slice());
        Some(Candidate::new(cmd, payload, Fields::default()))
    }

    /// Feeds the outcome of the last execution into the operator schedule.
    pub fn report(&mut self, interesting: bool) {
        self.schedule.record(&self.applied, interesting);
        self.applied.clear();
    }

    /// Advances the operator schedule by one execution.
    pub fn tick(&mut self) {
        self.schedule.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::find_command;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(0x5eed)
    }

    fn candidate(name: &str, payload: Vec<u8>) -> Candidate {
        Candidate::new(find_command(name).expect("known command"), payload, Fields::default())
    }

    fn quiet_settings() -> MutationSettings {
        MutationSettings {
            splice_probability: 0.0,
            field_probability: 0.0,
            opcode_override_probability: 0.0,
            namespace_override_probability: 0.0,
            queue_swap_probability: 0.0,
            length_override_probability: 0.0,
            oversized_log_probability: 0.0,
            ..MutationSettings::default()
        }
    }

    #[test]
    fn every_byte_op_keeps_buffers_sane() {
        let mut rng = rng();
        let donor = vec![0xEEu8; 40];
        for op in ByteOp::ALL {
            for len in [1usize, 2, 3, 4, 8, 64] {
                for _ in 0..50 {
                    let mut buf = vec![0x11u8; len];
                    apply_byte_op(op, &mut buf, Some(&donor), &mut rng);
                    match op {
                        ByteOp::DeleteRange => assert!(buf.len() < len || len == 1),
                        ByteOp::InsertBytes => assert!(buf.len() > len),
                        _ => assert_eq!(buf.len(), len, "{} changed length", op.name()),
                    }
                }
            }
        }
    }

    #[test]
    fn op_indices_match_table_order() {
        for (i, op) in ByteOp::ALL.iter().enumerate() {
            assert_eq!(op.index(), i);
        }
    }

    #[test]
    fn havoc_respects_max_len_and_records_ops() {
        let mut engine = MutationEngine::new(quiet_settings(), 32);
        let mut rng = rng();
        for _ in 0..200 {
            let out = engine.havoc(vec![0u8; 30], None, &mut rng);
            assert!(out.len() <= 32);
            let applied = engine.applied_ops().len();
            assert!((2..=128).contains(&applied), "stack size {applied}");
            assert!(applied.is_power_of_two());
            engine.applied.clear();
        }
    }

    #[test]
    fn empty_payload_skips_havoc() {
        let mut engine = MutationEngine::new(quiet_settings(), 4096);
        let parent = candidate("Identify", vec![]);
        let child = engine.mutate(&parent, None, &mut rng());
        assert!(child.payload.is_empty());
        assert!(engine.applied_ops().is_empty());
    }

    #[test]
    fn splice_joins_prefix_and_suffix() {
        let a = vec![0xAAu8; 10];
        let b = vec![0xBBu8; 10];
        let mut rng = rng();
        for _ in 0..50 {
            let out = splice(&a, &b, &mut rng).expect("long enough");
            assert_eq!(out.len(), 10);
            let first = out[0];
            let switch = out.iter().position(|x| *x != first).expect("two halves");
            assert!((1..9).contains(&switch));
        }
        assert!(splice(&[1, 2], &b, &mut rng).is_none());
    }

    #[test]
    fn field_ops_change_values() {
        let mut rng = rng();
        for op in [FieldOp::WalkingBitFlip, FieldOp::Arith] {
            for _ in 0..100 {
                assert_ne!(op.apply(0x1234_5678, &mut rng), 0x1234_5678, "{op:?}");
            }
        }
        let swapped = FieldOp::ByteOrderSwap.apply(0x1122_3344, &mut rng);
        assert!(swapped == 0x4433_2211 || swapped == 0x3344_1122);
        for _ in 0..20 {
            let replaced = FieldOp::ReplaceByte.apply(0, &mut rng);
            assert!(
                [0u32, 8, 16, 24].iter().any(|s| replaced & !(0xFFu32 << s) == 0),
                "only one byte may change, got {replaced:#x}"
            );
        }
    }

    #[test]
    fn forced_overrides_are_all_applied() {
        let settings = MutationSettings {
            opcode_override_probability: 1.0,
            namespace_override_probability: 1.0,
            queue_swap_probability: 1.0,
            length_override_probability: 1.0,
            ..quiet_settings()
        };
        let mut engine = MutationEngine::new(settings, 4096);
        let child = engine.mutate(&candidate("Read", vec![]), None, &mut rng());
        assert!(child.overrides.opcode().is_some());
        assert!(child.overrides.namespace().is_some());
        assert_eq!(child.overrides.queue(), Some(crate::protocol::CommandQueue::Admin));
        assert!(child.overrides.data_length().is_some());
        let counters = engine.counters();
        assert_eq!(counters.opcode_overrides, 1);
        assert_eq!(counters.queue_swaps, 1);
    }

    #[test]
    fn excluded_opcode_cancels_override() {
        let settings = MutationSettings {
            opcode_override_probability: 1.0,
            excluded_opcodes: (0..=255).collect(),
            ..quiet_settings()
        };
        let mut engine = MutationEngine::new(settings, 4096);
        let mut parent = candidate("Identify", vec![]);
        parent.overrides.set(Override::Opcode(0xC3));
        let child = engine.mutate(&parent, None, &mut rng());
        assert_eq!(child.overrides.opcode(), None);
        assert_eq!(engine.counters().excluded_opcodes, 1);
    }

    #[test]
    fn oversized_log_request_keeps_lower_cdw10() {
        let settings = MutationSettings {
            oversized_log_probability: 1.0,
            ..quiet_settings()
        };
        let mut engine = MutationEngine::new(settings, 4096);
        let mut parent = candidate("GetLogPage", vec![]);
        parent.fields.cdw10 = (0x7F << 16) | 0x02;
        let mut rng = rng();
        for _ in 0..20 {
            let child = engine.mutate(&parent, None, &mut rng);
            assert_eq!(child.fields.cdw10 & 0xFFFF, 0x02);
            let numdl = (child.fields.cdw10 >> 16) & 0x7FF;
            assert!((0x100..=0x7FF).contains(&numdl));
            assert_eq!(child.overrides.data_length(), Some((numdl + 1) * 4));
        }

        let other = engine.mutate(&candidate("Identify", vec![]), None, &mut rng);
        assert!(other.overrides.data_length().is_none());
    }

    #[test]
    fn random_candidate_uses_enabled_commands() {
        let engine = MutationEngine::new(quiet_settings(), 4096);
        let commands = vec![find_command("Write").expect("write")];
        let mut rng = rng();
        for _ in 0..20 {
            let cand = engine.random_candidate(&commands, &mut rng).expect("candidate");
            assert_eq!(cand.command.name, "Write");
            assert!((64..=512).contains(&cand.payload.len()));
        }
        assert!(engine.random_candidate(&[], &mut rng).is_none());
    }

    #[test]
    fn mutation_is_deterministic_for_a_seeded_rng() {
        let parent = candidate("Write", vec![0x5Au8; 64]);
        let mut a = MutationEngine::new(MutationSettings::default(), 4096);
        let mut b = MutationEngine::new(MutationSettings::default(), 4096);
        let mut rng_a = rng();
        let mut rng_b = rng();
        for _ in 0..20 {
            assert_eq!(
                a.mutate(&parent, None, &mut rng_a),
                b.mutate(&parent, None, &mut rng_b)
            );
        }
    }
}
