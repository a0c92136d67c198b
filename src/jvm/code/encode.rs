//! Encoding of label-based instruction lists into `Code` byte arrays
//!
//! Offsets are only known once every instruction has a size, and instruction sizes depend on
//! offsets (switch padding, jumps that don't fit in a signed 16-bit relative offset). We start
//! by assuming every jump is short, then repeatedly lay out the code and widen the jumps that are
//! oversized. This terminates because a jump never goes back to being short.
//!
//! Oversized `goto` and `jsr` turn into `goto_w` and `jsr_w`. Conditional branches have no wide
//! form, so they are inverted to jump over a `goto_w`:
//!
//! ```text,ignore,no_run
//!     if* L2            ifnot* L1
//! L1: ...         =>    goto_w L2
//!     ...           L1: ...
//! L2: ...               ...
//!                   L2: ...
//! ```
//!
//! With stack map frames in play, this makes `L1` a jump target that needs a frame.

use crate::jvm::class_file::Serialize;
use crate::jvm::code::{BranchInstruction, Element, EqComparison, Label, OrdComparison};
use crate::jvm::Error;
use crate::util::Width;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;

/// Range of relative jump offsets supported by `goto` and `if*` branch instructions
pub const SIGNED_16BIT_JUMP_RANGE: RangeInclusive<isize> =
    RangeInclusive::new(i16::MIN as isize, i16::MAX as isize);

/// Result of laying out and serializing a method body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCode {
    pub bytes: Vec<u8>,

    /// Offset of every placed label
    pub label_offsets: HashMap<Label, usize>,

    /// Offsets which only became jump targets because a conditional branch was widened
    pub widened_fallthroughs: Vec<usize>,
}

/// Lay out and serialize instructions
pub fn encode_elements(elements: &[Element]) -> Result<EncodedCode, Error> {
    encode_with_jump_range(elements, &SIGNED_16BIT_JUMP_RANGE)
}

/// Same as [`encode_elements`], but with a configurable short jump range (for testing)
pub fn encode_with_jump_range(
    elements: &[Element],
    short_jump_range: &RangeInclusive<isize>,
) -> Result<EncodedCode, Error> {
    let mut wide: HashSet<usize> = HashSet::new();

    let (offsets, label_offsets) = loop {
        let (offsets, label_offsets) = layout(elements, &wide)?;
        let mut changed = false;
        for (idx, element) in elements.iter().enumerate() {
            if let Element::Branch(branch) = element {
                if wide.contains(&idx) || !has_short_form(branch) {
                    continue;
                }
                let target = branch.targets()[0];
                let distance = label_offsets[&target] as isize - offsets[idx] as isize;
                if !short_jump_range.contains(&distance) {
                    wide.insert(idx);
                    changed = true;
                }
            }
        }
        if !changed {
            break (offsets, label_offsets);
        }
    };

    let mut bytes: Vec<u8> = vec![];
    let mut widened_fallthroughs = vec![];
    for (idx, element) in elements.iter().enumerate() {
        match element {
            Element::Label(_) => (),
            Element::Insn(insn) => insn.serialize(&mut bytes)?,
            Element::Branch(branch) => {
                let offset = offsets[idx];
                let is_wide = wide.contains(&idx);
                serialize_branch(branch, offset, is_wide, &label_offsets, &mut bytes)?;
                if is_wide && branch.is_conditional() {
                    widened_fallthroughs.push(bytes.len());
                }
            }
        }
    }

    if bytes.len() > u16::MAX as usize {
        return Err(Error::MethodCodeOverflow(bytes.len()));
    }
    Ok(EncodedCode {
        bytes,
        label_offsets,
        widened_fallthroughs,
    })
}

/// Does the branch have a 16-bit relative offset that may need widening?
fn has_short_form(branch: &BranchInstruction) -> bool {
    branch.is_conditional()
        || matches!(
            branch,
            BranchInstruction::Goto(_) | BranchInstruction::Jsr(_)
        )
}

/// Compute the offset of every element and every label
fn layout(
    elements: &[Element],
    wide: &HashSet<usize>,
) -> Result<(Vec<usize>, HashMap<Label, usize>), Error> {
    let mut offsets = Vec::with_capacity(elements.len());
    let mut label_offsets = HashMap::new();
    let mut offset = 0;
    for (idx, element) in elements.iter().enumerate() {
        offsets.push(offset);
        match element {
            Element::Label(label) => {
                if label_offsets.insert(*label, offset).is_some() {
                    return Err(Error::DuplicateLabel(*label));
                }
            }
            Element::Insn(insn) => offset += insn.width(),
            Element::Branch(branch) => offset += branch_width(branch, offset, wide.contains(&idx)),
        }
    }

    for element in elements {
        if let Element::Branch(branch) = element {
            for target in branch.targets() {
                if !label_offsets.contains_key(&target) {
                    return Err(Error::UnplacedLabel(target));
                }
            }
        }
    }
    Ok((offsets, label_offsets))
}

fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

/// Encoded width of a branch placed at `offset`
pub fn branch_width(branch: &BranchInstruction, offset: usize, wide: bool) -> usize {
    match branch {
        BranchInstruction::If(_, _)
        | BranchInstruction::IfICmp(_, _)
        | BranchInstruction::IfACmp(_, _)
        | BranchInstruction::IfNull(_, _) => {
            if wide {
                8
            } else {
                3
            }
        }
        BranchInstruction::Goto(_) | BranchInstruction::Jsr(_) => {
            if wide {
                5
            } else {
                3
            }
        }
        BranchInstruction::Ret(idx) => {
            if *idx <= u8::MAX as u16 {
                2
            } else {
                4
            }
        }
        BranchInstruction::TableSwitch { targets, .. } if !targets.is_empty() => {
            1 + switch_padding(offset) + 12 + 4 * targets.len()
        }
        BranchInstruction::TableSwitch { .. } => 1 + switch_padding(offset) + 8,
        BranchInstruction::LookupSwitch { targets, .. } => {
            1 + switch_padding(offset) + 8 + 8 * targets.len()
        }
        _ => 1,
    }
}

fn conditional_opcode(branch: &BranchInstruction) -> Option<u8> {
    let ord = |cmp: &OrdComparison, base: u8| -> u8 {
        base + match cmp {
            OrdComparison::EQ => 0,
            OrdComparison::NE => 1,
            OrdComparison::LT => 2,
            OrdComparison::GE => 3,
            OrdComparison::GT => 4,
            OrdComparison::LE => 5,
        }
    };
    let eq = |cmp: &EqComparison, base: u8| -> u8 {
        match cmp {
            EqComparison::EQ => base,
            EqComparison::NE => base + 1,
        }
    };
    Some(match branch {
        BranchInstruction::If(cmp, _) => ord(cmp, 0x99),
        BranchInstruction::IfICmp(cmp, _) => ord(cmp, 0x9f),
        BranchInstruction::IfACmp(cmp, _) => eq(cmp, 0xa5),
        BranchInstruction::IfNull(cmp, _) => eq(cmp, 0xc6),
        _ => return None,
    })
}

fn serialize_branch(
    branch: &BranchInstruction,
    offset: usize,
    wide: bool,
    label_offsets: &HashMap<Label, usize>,
    bytes: &mut Vec<u8>,
) -> Result<(), Error> {
    let relative = |label: &Label| -> isize { label_offsets[label] as isize - offset as isize };

    if let Some(opcode) = conditional_opcode(branch) {
        let target = &branch.targets()[0];
        if wide {
            let inverted = branch.inverted(*target).and_then(|b| conditional_opcode(&b));
            inverted.unwrap_or(opcode).serialize(bytes)?;
            8i16.serialize(bytes)?;
            0xc8u8.serialize(bytes)?;
            ((relative(target) - 3) as i32).serialize(bytes)?;
        } else {
            opcode.serialize(bytes)?;
            (relative(target) as i16).serialize(bytes)?;
        }
        return Ok(());
    }

    match branch {
        BranchInstruction::Goto(target) | BranchInstruction::Jsr(target) => {
            let is_goto = matches!(branch, BranchInstruction::Goto(_));
            if wide {
                (if is_goto { 0xc8u8 } else { 0xc9u8 }).serialize(bytes)?;
                (relative(target) as i32).serialize(bytes)?;
            } else {
                (if is_goto { 0xa7u8 } else { 0xa8u8 }).serialize(bytes)?;
                (relative(target) as i16).serialize(bytes)?;
            }
        }
        BranchInstruction::Ret(idx) => match u8::try_from(*idx) {
            Ok(b) => {
                0xa9u8.serialize(bytes)?;
                b.serialize(bytes)?;
            }
            Err(_) => {
                0xc4u8.serialize(bytes)?;
                0xa9u8.serialize(bytes)?;
                idx.serialize(bytes)?;
            }
        },
        BranchInstruction::TableSwitch {
            default,
            low,
            targets,
        } if !targets.is_empty() => {
            0xaau8.serialize(bytes)?;
            for _ in 0..switch_padding(offset) {
                0x00u8.serialize(bytes)?;
            }
            (relative(default) as i32).serialize(bytes)?;
            low.serialize(bytes)?;
            (low + targets.len() as i32 - 1).serialize(bytes)?;
            for target in targets {
                (relative(target) as i32).serialize(bytes)?;
            }
        }
        BranchInstruction::TableSwitch { default, .. } => {
            // A `tableswitch` needs at least one entry: without any, it is an empty `lookupswitch`
            0xabu8.serialize(bytes)?;
            for _ in 0..switch_padding(offset) {
                0x00u8.serialize(bytes)?;
            }
            (relative(default) as i32).serialize(bytes)?;
            0i32.serialize(bytes)?;
        }
        BranchInstruction::LookupSwitch { default, targets } => {
            0xabu8.serialize(bytes)?;
            for _ in 0..switch_padding(offset) {
                0x00u8.serialize(bytes)?;
            }
            (relative(default) as i32).serialize(bytes)?;
            (targets.len() as i32).serialize(bytes)?;
            let mut sorted: Vec<&(i32, Label)> = targets.iter().collect();
            sorted.sort_by_key(|(key, _)| *key);
            for (key, target) in sorted {
                key.serialize(bytes)?;
                (relative(target) as i32).serialize(bytes)?;
            }
        }
        BranchInstruction::IReturn => 0xacu8.serialize(bytes)?,
        BranchInstruction::LReturn => 0xadu8.serialize(bytes)?,
        BranchInstruction::FReturn => 0xaeu8.serialize(bytes)?,
        BranchInstruction::DReturn => 0xafu8.serialize(bytes)?,
        BranchInstruction::AReturn => 0xb0u8.serialize(bytes)?,
        BranchInstruction::Return => 0xb1u8.serialize(bytes)?,
        BranchInstruction::AThrow => 0xbfu8.serialize(bytes)?,
        BranchInstruction::If(_, _)
        | BranchInstruction::IfICmp(_, _)
        | BranchInstruction::IfACmp(_, _)
        | BranchInstruction::IfNull(_, _) => (),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{decode_instructions, Instruction, LabelGenerator, RawElement};

    #[test]
    fn short_jumps_stay_short() {
        let mut labels = LabelGenerator::default();
        let (start, end) = (labels.fresh_label(), labels.fresh_label());
        let elements = vec![
            Element::Label(start),
            Element::Insn(Instruction::ILoad(0)),
            Element::Branch(BranchInstruction::If(OrdComparison::EQ, end)),
            Element::Branch(BranchInstruction::Goto(start)),
            Element::Label(end),
            Element::Branch(BranchInstruction::Return),
        ];
        let encoded = encode_elements(&elements).unwrap();
        assert_eq!(
            encoded.bytes,
            vec![0x1a, 0x99, 0x00, 0x06, 0xa7, 0xff, 0xfc, 0xb1]
        );
        assert_eq!(encoded.label_offsets[&end], 7);
        assert!(encoded.widened_fallthroughs.is_empty());
    }

    #[test]
    fn oversized_jumps_are_widened() {
        let mut labels = LabelGenerator::default();
        let (start, end) = (labels.fresh_label(), labels.fresh_label());
        let mut elements = vec![
            Element::Label(start),
            Element::Insn(Instruction::ILoad(0)),
            Element::Branch(BranchInstruction::If(OrdComparison::EQ, end)),
        ];
        for _ in 0..8 {
            elements.push(Element::Insn(Instruction::Nop));
        }
        elements.push(Element::Branch(BranchInstruction::Goto(start)));
        elements.push(Element::Label(end));
        elements.push(Element::Branch(BranchInstruction::Return));

        let encoded = encode_with_jump_range(&elements, &(-8..=8)).unwrap();
        let decoded = decode_instructions(&encoded.bytes).unwrap();
        assert_eq!(
            decoded[1],
            (1, RawElement::Branch(BranchInstruction::If(OrdComparison::NE, 9)))
        );
        assert_eq!(decoded[2], (4, RawElement::Branch(BranchInstruction::Goto(22))));
        assert_eq!(decoded[11], (17, RawElement::Branch(BranchInstruction::Goto(0))));
        assert_eq!(encoded.widened_fallthroughs, vec![9]);
    }

    #[test]
    fn unplaced_label_is_an_error() {
        let mut labels = LabelGenerator::default();
        let nowhere = labels.fresh_label();
        let elements = vec![Element::Branch(BranchInstruction::Goto(nowhere))];
        assert!(matches!(
            encode_elements(&elements),
            Err(Error::UnplacedLabel(label)) if label == nowhere
        ));
    }
}
