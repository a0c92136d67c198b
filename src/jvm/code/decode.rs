//! Decoding of `Code` attribute byte arrays
//!
//! This is the first half of turning bytecode into the label-based representation: instructions
//! are decoded along with their offsets, and jump targets are left as absolute offsets. Assigning
//! labels happens once all the other offset-carrying tables (exception handlers, debug tables,
//! stack map frames) are known.

use crate::jvm::class_file::Deserialize;
use crate::jvm::code::{
    array_type_from_code, BranchInstruction, CompareMode, EqComparison, Instruction, InvokeType,
    OrdComparison, ShiftType,
};
use crate::jvm::{ClassConstantIndex, ClassFormatError, ConstantIndex, InvokeDynamicConstantIndex};
use std::io::Cursor;

/// Decoded instruction, with jump targets still as absolute offsets
#[derive(Clone, Debug, PartialEq)]
pub enum RawElement {
    Insn(Instruction),
    Branch(BranchInstruction<usize>),
}

/// Decode a full code array, returning each instruction along with its offset
pub fn decode_instructions(code: &[u8]) -> Result<Vec<(usize, RawElement)>, ClassFormatError> {
    let mut reader = Cursor::new(code);
    let mut decoded = vec![];
    while (reader.position() as usize) < code.len() {
        let offset = reader.position() as usize;
        let element = decode_one(&mut reader, offset)?;
        decoded.push((offset, element));
    }
    Ok(decoded)
}

fn jump_target(offset: usize, relative: i32) -> Result<usize, ClassFormatError> {
    let target = offset as i64 + relative as i64;
    if target < 0 {
        return Err(ClassFormatError::BadCodeOffset(offset));
    }
    Ok(target as usize)
}

fn decode_one(reader: &mut Cursor<&[u8]>, offset: usize) -> Result<RawElement, ClassFormatError> {
    use Instruction::*;

    let short_jump = |reader: &mut Cursor<&[u8]>| -> Result<usize, ClassFormatError> {
        jump_target(offset, i16::deserialize(reader)? as i32)
    };
    let index = |reader: &mut Cursor<&[u8]>| -> Result<ConstantIndex, ClassFormatError> {
        ConstantIndex::deserialize(reader)
    };
    let class = |reader: &mut Cursor<&[u8]>| -> Result<ClassConstantIndex, ClassFormatError> {
        ClassConstantIndex::deserialize(reader)
    };
    let local = |reader: &mut Cursor<&[u8]>| -> Result<u16, ClassFormatError> {
        Ok(u8::deserialize(reader)? as u16)
    };
    let ord = |opcode: u8, base: u8| -> OrdComparison {
        match opcode - base {
            0 => OrdComparison::EQ,
            1 => OrdComparison::NE,
            2 => OrdComparison::LT,
            3 => OrdComparison::GE,
            4 => OrdComparison::GT,
            _ => OrdComparison::LE,
        }
    };

    let opcode = u8::deserialize(reader)?;
    let insn = match opcode {
        0x00 => Nop,
        0x01 => AConstNull,
        0x02 => IConstM1,
        0x03 => IConst0,
        0x04 => IConst1,
        0x05 => IConst2,
        0x06 => IConst3,
        0x07 => IConst4,
        0x08 => IConst5,
        0x09 => LConst0,
        0x0a => LConst1,
        0x0b => FConst0,
        0x0c => FConst1,
        0x0d => FConst2,
        0x0e => DConst0,
        0x0f => DConst1,
        0x10 => BiPush(i8::deserialize(reader)?),
        0x11 => SiPush(i16::deserialize(reader)?),
        0x12 => Ldc(ConstantIndex(u8::deserialize(reader)? as u16)),
        0x13 => Ldc(index(reader)?),
        0x14 => Ldc2(index(reader)?),
        0x15 => ILoad(local(reader)?),
        0x16 => LLoad(local(reader)?),
        0x17 => FLoad(local(reader)?),
        0x18 => DLoad(local(reader)?),
        0x19 => ALoad(local(reader)?),
        0x1a..=0x1d => ILoad((opcode - 0x1a) as u16),
        0x1e..=0x21 => LLoad((opcode - 0x1e) as u16),
        0x22..=0x25 => FLoad((opcode - 0x22) as u16),
        0x26..=0x29 => DLoad((opcode - 0x26) as u16),
        0x2a..=0x2d => ALoad((opcode - 0x2a) as u16),
        0x2e => IALoad,
        0x2f => LALoad,
        0x30 => FALoad,
        0x31 => DALoad,
        0x32 => AALoad,
        0x33 => BALoad,
        0x34 => CALoad,
        0x35 => SALoad,
        0x36 => IStore(local(reader)?),
        0x37 => LStore(local(reader)?),
        0x38 => FStore(local(reader)?),
        0x39 => DStore(local(reader)?),
        0x3a => AStore(local(reader)?),
        0x3b..=0x3e => IStore((opcode - 0x3b) as u16),
        0x3f..=0x42 => LStore((opcode - 0x3f) as u16),
        0x43..=0x46 => FStore((opcode - 0x43) as u16),
        0x47..=0x4a => DStore((opcode - 0x47) as u16),
        0x4b..=0x4e => AStore((opcode - 0x4b) as u16),
        0x4f => IAStore,
        0x50 => LAStore,
        0x51 => FAStore,
        0x52 => DAStore,
        0x53 => AAStore,
        0x54 => BAStore,
        0x55 => CAStore,
        0x56 => SAStore,
        0x57 => Pop,
        0x58 => Pop2,
        0x59 => Dup,
        0x5a => DupX1,
        0x5b => DupX2,
        0x5c => Dup2,
        0x5d => Dup2X1,
        0x5e => Dup2X2,
        0x5f => Swap,
        0x60 => IAdd,
        0x61 => LAdd,
        0x62 => FAdd,
        0x63 => DAdd,
        0x64 => ISub,
        0x65 => LSub,
        0x66 => FSub,
        0x67 => DSub,
        0x68 => IMul,
        0x69 => LMul,
        0x6a => FMul,
        0x6b => DMul,
        0x6c => IDiv,
        0x6d => LDiv,
        0x6e => FDiv,
        0x6f => DDiv,
        0x70 => IRem,
        0x71 => LRem,
        0x72 => FRem,
        0x73 => DRem,
        0x74 => INeg,
        0x75 => LNeg,
        0x76 => FNeg,
        0x77 => DNeg,
        0x78 => ISh(ShiftType::Left),
        0x79 => LSh(ShiftType::Left),
        0x7a => ISh(ShiftType::ArithmeticRight),
        0x7b => LSh(ShiftType::ArithmeticRight),
        0x7c => ISh(ShiftType::LogicalRight),
        0x7d => LSh(ShiftType::LogicalRight),
        0x7e => IAnd,
        0x7f => LAnd,
        0x80 => IOr,
        0x81 => LOr,
        0x82 => IXor,
        0x83 => LXor,
        0x84 => IInc(local(reader)?, i8::deserialize(reader)? as i16),
        0x85 => I2L,
        0x86 => I2F,
        0x87 => I2D,
        0x88 => L2I,
        0x89 => L2F,
        0x8a => L2D,
        0x8b => F2I,
        0x8c => F2L,
        0x8d => F2D,
        0x8e => D2I,
        0x8f => D2L,
        0x90 => D2F,
        0x91 => I2B,
        0x92 => I2C,
        0x93 => I2S,
        0x94 => LCmp,
        0x95 => FCmp(CompareMode::L),
        0x96 => FCmp(CompareMode::G),
        0x97 => DCmp(CompareMode::L),
        0x98 => DCmp(CompareMode::G),
        0x99..=0x9e => {
            let cmp = ord(opcode, 0x99);
            return Ok(RawElement::Branch(BranchInstruction::If(
                cmp,
                short_jump(reader)?,
            )));
        }
        0x9f..=0xa4 => {
            let cmp = ord(opcode, 0x9f);
            return Ok(RawElement::Branch(BranchInstruction::IfICmp(
                cmp,
                short_jump(reader)?,
            )));
        }
        0xa5 | 0xa6 => {
            let cmp = if opcode == 0xa5 {
                EqComparison::EQ
            } else {
                EqComparison::NE
            };
            return Ok(RawElement::Branch(BranchInstruction::IfACmp(
                cmp,
                short_jump(reader)?,
            )));
        }
        0xa7 => return Ok(RawElement::Branch(BranchInstruction::Goto(short_jump(reader)?))),
        0xa8 => return Ok(RawElement::Branch(BranchInstruction::Jsr(short_jump(reader)?))),
        0xa9 => return Ok(RawElement::Branch(BranchInstruction::Ret(local(reader)?))),
        0xaa | 0xab => return decode_switch(reader, offset, opcode),
        0xac => return Ok(RawElement::Branch(BranchInstruction::IReturn)),
        0xad => return Ok(RawElement::Branch(BranchInstruction::LReturn)),
        0xae => return Ok(RawElement::Branch(BranchInstruction::FReturn)),
        0xaf => return Ok(RawElement::Branch(BranchInstruction::DReturn)),
        0xb0 => return Ok(RawElement::Branch(BranchInstruction::AReturn)),
        0xb1 => return Ok(RawElement::Branch(BranchInstruction::Return)),
        0xb2 => GetStatic(index(reader)?),
        0xb3 => PutStatic(index(reader)?),
        0xb4 => GetField(index(reader)?),
        0xb5 => PutField(index(reader)?),
        0xb6 => Invoke(InvokeType::Virtual, index(reader)?),
        0xb7 => Invoke(InvokeType::Special, index(reader)?),
        0xb8 => Invoke(InvokeType::Static, index(reader)?),
        0xb9 => {
            let method = index(reader)?;
            let count = u8::deserialize(reader)?;
            let _zero = u8::deserialize(reader)?;
            Invoke(InvokeType::Interface(count), method)
        }
        0xba => {
            let call_site = InvokeDynamicConstantIndex::deserialize(reader)?;
            let _zero = u16::deserialize(reader)?;
            InvokeDynamic(call_site)
        }
        0xbb => New(class(reader)?),
        0xbc => {
            let code = u8::deserialize(reader)?;
            let base_type = array_type_from_code(code)
                .ok_or(ClassFormatError::UnknownOpcode { opcode, offset })?;
            NewArray(base_type)
        }
        0xbd => ANewArray(class(reader)?),
        0xbe => ArrayLength,
        0xbf => return Ok(RawElement::Branch(BranchInstruction::AThrow)),
        0xc0 => CheckCast(class(reader)?),
        0xc1 => InstanceOf(class(reader)?),
        0xc2 => MonitorEnter,
        0xc3 => MonitorExit,
        0xc4 => return decode_wide(reader, offset),
        0xc5 => MultiANewArray(class(reader)?, u8::deserialize(reader)?),
        0xc6 | 0xc7 => {
            let cmp = if opcode == 0xc6 {
                EqComparison::EQ
            } else {
                EqComparison::NE
            };
            return Ok(RawElement::Branch(BranchInstruction::IfNull(
                cmp,
                short_jump(reader)?,
            )));
        }
        0xc8 => {
            let target = jump_target(offset, i32::deserialize(reader)?)?;
            return Ok(RawElement::Branch(BranchInstruction::Goto(target)));
        }
        0xc9 => {
            let target = jump_target(offset, i32::deserialize(reader)?)?;
            return Ok(RawElement::Branch(BranchInstruction::Jsr(target)));
        }
        _ => return Err(ClassFormatError::UnknownOpcode { opcode, offset }),
    };
    Ok(RawElement::Insn(insn))
}

fn decode_wide(reader: &mut Cursor<&[u8]>, offset: usize) -> Result<RawElement, ClassFormatError> {
    use Instruction::*;

    let opcode = u8::deserialize(reader)?;
    let idx = u16::deserialize(reader)?;
    let insn = match opcode {
        0x15 => ILoad(idx),
        0x16 => LLoad(idx),
        0x17 => FLoad(idx),
        0x18 => DLoad(idx),
        0x19 => ALoad(idx),
        0x36 => IStore(idx),
        0x37 => LStore(idx),
        0x38 => FStore(idx),
        0x39 => DStore(idx),
        0x3a => AStore(idx),
        0x84 => IInc(idx, i16::deserialize(reader)?),
        0xa9 => return Ok(RawElement::Branch(BranchInstruction::Ret(idx))),
        _ => return Err(ClassFormatError::UnknownOpcode { opcode, offset }),
    };
    Ok(RawElement::Insn(insn))
}

fn decode_switch(
    reader: &mut Cursor<&[u8]>,
    offset: usize,
    opcode: u8,
) -> Result<RawElement, ClassFormatError> {
    // Operands start at the next multiple of four from the start of the code
    while reader.position() % 4 != 0 {
        u8::deserialize(reader)?;
    }
    let remaining = reader.get_ref().len() - reader.position() as usize;
    let default = jump_target(offset, i32::deserialize(reader)?)?;

    if opcode == 0xaa {
        let low = i32::deserialize(reader)?;
        let high = i32::deserialize(reader)?;
        let count = high as i64 - low as i64 + 1;
        if count < 0 || count as usize * 4 > remaining {
            return Err(ClassFormatError::BadCodeOffset(offset));
        }
        let targets = (0..count)
            .map(|_| jump_target(offset, i32::deserialize(reader)?))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RawElement::Branch(BranchInstruction::TableSwitch {
            default,
            low,
            targets,
        }))
    } else {
        let count = i32::deserialize(reader)?;
        if count < 0 || count as usize * 8 > remaining {
            return Err(ClassFormatError::BadCodeOffset(offset));
        }
        let targets = (0..count)
            .map(|_| {
                let key = i32::deserialize(reader)?;
                Ok((key, jump_target(offset, i32::deserialize(reader)?)?))
            })
            .collect::<Result<Vec<_>, ClassFormatError>>()?;
        Ok(RawElement::Branch(BranchInstruction::LookupSwitch {
            default,
            targets,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_wide_and_short_forms() {
        let code = [
            0x1b, // iload_1
            0xc4, 0x15, 0x01, 0x00, // wide iload 256
            0x84, 0x01, 0xff, // iinc 1, -1
            0xc8, 0xff, 0xff, 0xff, 0xf8, // goto_w -8
            0xb1, // return
        ];
        let decoded = decode_instructions(&code).unwrap();
        assert_eq!(
            decoded,
            vec![
                (0, RawElement::Insn(Instruction::ILoad(1))),
                (1, RawElement::Insn(Instruction::ILoad(256))),
                (5, RawElement::Insn(Instruction::IInc(1, -1))),
                (8, RawElement::Branch(BranchInstruction::Goto(0))),
                (13, RawElement::Branch(BranchInstruction::Return)),
            ]
        );
    }

    #[test]
    fn decodes_padded_switch() {
        let code = [
            0x03, // iconst_0
            0xaa, // tableswitch
            0x00, 0x00, // padding
            0x00, 0x00, 0x00, 0x13, // default: +19
            0x00, 0x00, 0x00, 0x00, // low 0
            0x00, 0x00, 0x00, 0x00, // high 0
            0x00, 0x00, 0x00, 0x13, // 0: +19
            0xb1, // return
        ];
        let decoded = decode_instructions(&code).unwrap();
        assert_eq!(
            decoded[1],
            (
                1,
                RawElement::Branch(BranchInstruction::TableSwitch {
                    default: 20,
                    low: 0,
                    targets: vec![20],
                })
            )
        );
    }

    #[test]
    fn rejects_unknown_and_truncated() {
        assert_eq!(
            decode_instructions(&[0xcb]).unwrap_err(),
            ClassFormatError::UnknownOpcode {
                opcode: 0xcb,
                offset: 0
            }
        );
        assert_eq!(
            decode_instructions(&[0x11, 0x00]).unwrap_err(),
            ClassFormatError::Truncated
        );
    }
}
