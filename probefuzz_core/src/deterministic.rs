use crate::input::{Candidate, FieldId};
use crate::mutator::{INTERESTING_8, INTERESTING_32};

const BIT_FLIPS: u32 = 32;
const BYTE_SHIFTS: u32 = 4;

/// Position inside a seed's deterministic sequence. Stored on the seed so
/// the sequence can be resumed one candidate at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetCursor {
    field: usize,
    step: u32,
}

impl DetCursor {
    pub fn is_exhausted(&self) -> bool {
        self.field >= FieldId::PARAMETERS.len()
    }
}

/// Produces the next deterministic child of `base` and advances `cursor`.
///
/// For every non-zero parameter dword, in order: the 32 single-bit flips,
/// `+d` and `-d` for `d` in `1..=arith_max`, each 32-bit interesting value,
/// then each 8-bit interesting value in each of the four byte lanes.
/// Candidates equal to the original value are skipped.
pub fn next_candidate(base: &Candidate, cursor: &mut DetCursor, arith_max: u32) -> Option<Candidate> {
    let arith_steps = arith_max * 2;
    let word_steps = BIT_FLIPS + arith_steps + INTERESTING_32.len() as u32;
    let lanes = INTERESTING_8.len() as u32;
    let total_steps = word_steps + BYTE_SHIFTS * lanes;

    while let Some(&field) = FieldId::PARAMETERS.get(cursor.field) {
        let original = base.fields.get(field);
        if original == 0 || cursor.step >= total_steps {
            cursor.field += 1;
            cursor.step = 0;
            continue;
        }
        let step = cursor.step;
        cursor.step += 1;

        let value = if step < BIT_FLIPS {
            original ^ (1 << step)
        } else if step < BIT_FLIPS + arith_steps {
            let k = step - BIT_FLIPS;
            let d = k / 2 + 1;
            if k % 2 == 0 { original.wrapping_add(d) } else { original.wrapping_sub(d) }
        } else if step < word_steps {
            INTERESTING_32[(step - BIT_FLIPS - arith_steps) as usize] as u32
        } else {
            let k = step - word_steps;
            let shift = (k / lanes) * 8;
            let byte = u32::from(INTERESTING_8[(k % lanes) as usize] as u8);
            (original & !(0xFF << shift)) | (byte << shift)
        };
        if value == original {
            continue;
        }

        let mut child = base.clone();
        child.fields.set(field, value);
        return Some(child);
    }
    None
}

/// Lazy iterator over a seed's whole deterministic sequence.
pub struct DeterministicStage<'a> {
    base: &'a Candidate,
    cursor: DetCursor,
    arith_max: u32,
}

impl<'a> DeterministicStage<'a> {
    pub fn new(base: &'a Candidate, arith_max: u32) -> Self {
        Self::resume(base, DetCursor::default(), arith_max)
    }

    pub fn resume(base: &'a Candidate, cursor: DetCursor, arith_max: u32) -> Self {
        Self {
            base,
            cursor,
            arith_max,
        }
    }

    pub fn cursor(&self) -> DetCursor {
        self.cursor
    }
}

impl Iterator for DeterministicStage<'_> {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        next_candidate(self.base, &mut self.cursor, self.arith_max)
    }
}
