//! Instructions as they appear in the class model
//!
//! The representation is slightly different from the binary format to make rewriting
//! convenient:
//!
//!   - `wide` doesn't show up at all, but instead gets merged into the instructions it is allowed
//!     to modify
//!
//!   - short forms (`iload_0`, `ldc` vs. `ldc_w`, `goto` vs. `goto_w`) are not distinguished,
//!     the encoder picks the smallest form that fits
//!
//!   - some instructions (like the branches) get abstracted into one instruction with a field.
//!     This helps with repetitive pattern matches and also simplifies tasks like inverting a
//!     branch condition.
//!
//!   - branch targets are [`Label`]s rather than relative offsets

use crate::jvm::class_file::Serialize;
use crate::jvm::code::Label;
use crate::jvm::{BaseType, ClassConstantIndex, ConstantIndex, InvokeDynamicConstantIndex};
use crate::util::Width;
use byteorder::WriteBytesExt;
use std::convert::TryFrom;
use std::io::Result;
use std::ops::Not;

/// One entry in a method's instruction list
#[derive(Clone, Debug, PartialEq)]
pub enum Element {
    /// Position marker, zero width
    Label(Label),

    /// Straight-line instruction
    Insn(Instruction),

    /// Instruction that may transfer control somewhere other than the next element
    Branch(BranchInstruction),
}

impl Element {
    pub fn is_instruction(&self) -> bool {
        !matches!(self, Element::Label(_))
    }
}

/// Non-branching JVM bytecode instruction
///
/// Constant pool operands stay as indices into the owning class's pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Instruction {
    Nop,
    AConstNull,
    IConstM1,
    IConst0,
    IConst1,
    IConst2,
    IConst3,
    IConst4,
    IConst5,
    LConst0,
    LConst1,
    FConst0,
    FConst1,
    FConst2,
    DConst0,
    DConst1,
    BiPush(i8),
    SiPush(i16),
    Ldc(ConstantIndex), // covers both `ldc` and `ldc_w`
    Ldc2(ConstantIndex),
    ILoad(u16), // covers `iload`, `iload{0,3}`, and `wide iload`
    LLoad(u16),
    FLoad(u16),
    DLoad(u16),
    ALoad(u16),
    IALoad,
    LALoad,
    FALoad,
    DALoad,
    AALoad,
    BALoad,
    CALoad,
    SALoad,
    IStore(u16), // covers `istore`, `istore{0,3}`, and `wide istore`
    LStore(u16),
    FStore(u16),
    DStore(u16),
    AStore(u16),
    IAStore,
    LAStore,
    FAStore,
    DAStore,
    AAStore,
    BAStore,
    CAStore,
    SAStore,
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    IAdd,
    LAdd,
    FAdd,
    DAdd,
    ISub,
    LSub,
    FSub,
    DSub,
    IMul,
    LMul,
    FMul,
    DMul,
    IDiv,
    LDiv,
    FDiv,
    DDiv,
    IRem,
    LRem,
    FRem,
    DRem,
    INeg,
    LNeg,
    FNeg,
    DNeg,
    ISh(ShiftType), // covers `ishr`, `ishl`, and `iushr`
    LSh(ShiftType), // covers `lshr`, `lshl`, and `lushr`
    IAnd,
    LAnd,
    IOr,
    LOr,
    IXor,
    LXor,
    IInc(u16, i16), // covers `iinc` and `wide iinc`
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
    LCmp,
    FCmp(CompareMode), // covers `fcmpl` and `fcmpg`
    DCmp(CompareMode), // covers `dcmpl` and `dcmpg`
    GetStatic(ConstantIndex),
    PutStatic(ConstantIndex),
    GetField(ConstantIndex),
    PutField(ConstantIndex),
    Invoke(InvokeType, ConstantIndex),
    InvokeDynamic(InvokeDynamicConstantIndex),
    New(ClassConstantIndex),
    NewArray(BaseType),
    ANewArray(ClassConstantIndex),
    ArrayLength,
    CheckCast(ClassConstantIndex),
    InstanceOf(ClassConstantIndex),
    MonitorEnter,
    MonitorExit,
    MultiANewArray(ClassConstantIndex, u8),
}

impl Instruction {
    /// Instruction pushing a small integer constant, using the shortest encoding
    pub fn push_int(value: i32) -> Option<Instruction> {
        Some(match value {
            -1 => Instruction::IConstM1,
            0 => Instruction::IConst0,
            1 => Instruction::IConst1,
            2 => Instruction::IConst2,
            3 => Instruction::IConst3,
            4 => Instruction::IConst4,
            5 => Instruction::IConst5,
            _ => {
                if let Ok(b) = i8::try_from(value) {
                    Instruction::BiPush(b)
                } else if let Ok(s) = i16::try_from(value) {
                    Instruction::SiPush(s)
                } else {
                    return None;
                }
            }
        })
    }

    /// Does this instruction only push a value, with no other effect?
    pub fn is_pure_push(&self) -> bool {
        use Instruction::*;
        matches!(
            self,
            AConstNull
                | IConstM1
                | IConst0
                | IConst1
                | IConst2
                | IConst3
                | IConst4
                | IConst5
                | LConst0
                | LConst1
                | FConst0
                | FConst1
                | FConst2
                | DConst0
                | DConst1
                | BiPush(_)
                | SiPush(_)
                | Ldc(_)
                | Ldc2(_)
                | ILoad(_)
                | LLoad(_)
                | FLoad(_)
                | DLoad(_)
                | ALoad(_)
        )
    }
}

/// Encoded length in bytes
impl Width for Instruction {
    fn width(&self) -> usize {
        fn load_or_store(idx: u16) -> usize {
            match idx {
                0..=3 => 1,
                4..=255 => 2,
                _ => 4,
            }
        }

        use Instruction::*;
        match self {
            BiPush(_) | NewArray(_) => 2,
            SiPush(_) => 3,
            Ldc(idx) => {
                if idx.0 <= u8::MAX as u16 {
                    2
                } else {
                    3
                }
            }
            Ldc2(_) => 3,
            ILoad(idx) | LLoad(idx) | FLoad(idx) | DLoad(idx) | ALoad(idx) => load_or_store(*idx),
            IStore(idx) | LStore(idx) | FStore(idx) | DStore(idx) | AStore(idx) => {
                load_or_store(*idx)
            }
            IInc(idx, diff) => {
                if *idx <= u8::MAX as u16 && i8::try_from(*diff).is_ok() {
                    3
                } else {
                    6
                }
            }
            GetStatic(_) | PutStatic(_) | GetField(_) | PutField(_) => 3,
            Invoke(InvokeType::Interface(_), _) => 5,
            Invoke(_, _) => 3,
            InvokeDynamic(_) => 5,
            New(_) | ANewArray(_) | CheckCast(_) | InstanceOf(_) => 3,
            MultiANewArray(_, _) => 4,
            _ => 1,
        }
    }
}

impl Serialize for Instruction {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        /* The load/store instructions follow the same pattern:
         *
         *   - short form (0-3) have special bytes
         *   - normal form (0-255) use `iload` plus a byte operand
         *   - wide form (255-65535) use `wide iload` plus two byte operands
         */
        fn serialize_load_or_store<W: WriteBytesExt>(
            idx: u16,
            short_form_start: u8,
            normal_form: u8,
            writer: &mut W,
        ) -> Result<()> {
            match u8::try_from(idx) {
                Ok(n @ 0..=3) => (short_form_start + n).serialize(writer),
                Ok(n) => {
                    normal_form.serialize(writer)?;
                    n.serialize(writer)
                }
                Err(_) => {
                    0xC4u8.serialize(writer)?;
                    normal_form.serialize(writer)?;
                    idx.serialize(writer)
                }
            }
        }

        fn with_index<W: WriteBytesExt>(opcode: u8, idx: u16, writer: &mut W) -> Result<()> {
            opcode.serialize(writer)?;
            idx.serialize(writer)
        }

        use Instruction::*;
        match self {
            Nop => 0x00u8.serialize(writer)?,
            AConstNull => 0x01u8.serialize(writer)?,
            IConstM1 => 0x02u8.serialize(writer)?,
            IConst0 => 0x03u8.serialize(writer)?,
            IConst1 => 0x04u8.serialize(writer)?,
            IConst2 => 0x05u8.serialize(writer)?,
            IConst3 => 0x06u8.serialize(writer)?,
            IConst4 => 0x07u8.serialize(writer)?,
            IConst5 => 0x08u8.serialize(writer)?,
            LConst0 => 0x09u8.serialize(writer)?,
            LConst1 => 0x0au8.serialize(writer)?,
            FConst0 => 0x0bu8.serialize(writer)?,
            FConst1 => 0x0cu8.serialize(writer)?,
            FConst2 => 0x0du8.serialize(writer)?,
            DConst0 => 0x0eu8.serialize(writer)?,
            DConst1 => 0x0fu8.serialize(writer)?,
            BiPush(b) => {
                0x10u8.serialize(writer)?;
                b.serialize(writer)?;
            }
            SiPush(s) => {
                0x11u8.serialize(writer)?;
                s.serialize(writer)?;
            }
            Ldc(ConstantIndex(idx)) => match u8::try_from(*idx) {
                Ok(b) => {
                    0x12u8.serialize(writer)?;
                    b.serialize(writer)?;
                }
                Err(_) => with_index(0x13, *idx, writer)?,
            },
            Ldc2(ConstantIndex(idx)) => with_index(0x14, *idx, writer)?,
            ILoad(idx) => serialize_load_or_store(*idx, 0x1A, 0x15, writer)?,
            LLoad(idx) => serialize_load_or_store(*idx, 0x1E, 0x16, writer)?,
            FLoad(idx) => serialize_load_or_store(*idx, 0x22, 0x17, writer)?,
            DLoad(idx) => serialize_load_or_store(*idx, 0x26, 0x18, writer)?,
            ALoad(idx) => serialize_load_or_store(*idx, 0x2A, 0x19, writer)?,
            IALoad => 0x2eu8.serialize(writer)?,
            LALoad => 0x2fu8.serialize(writer)?,
            FALoad => 0x30u8.serialize(writer)?,
            DALoad => 0x31u8.serialize(writer)?,
            AALoad => 0x32u8.serialize(writer)?,
            BALoad => 0x33u8.serialize(writer)?,
            CALoad => 0x34u8.serialize(writer)?,
            SALoad => 0x35u8.serialize(writer)?,
            IStore(idx) => serialize_load_or_store(*idx, 0x3B, 0x36, writer)?,
            LStore(idx) => serialize_load_or_store(*idx, 0x3F, 0x37, writer)?,
            FStore(idx) => serialize_load_or_store(*idx, 0x43, 0x38, writer)?,
            DStore(idx) => serialize_load_or_store(*idx, 0x47, 0x39, writer)?,
            AStore(idx) => serialize_load_or_store(*idx, 0x4B, 0x3A, writer)?,
            IAStore => 0x4fu8.serialize(writer)?,
            LAStore => 0x50u8.serialize(writer)?,
            FAStore => 0x51u8.serialize(writer)?,
            DAStore => 0x52u8.serialize(writer)?,
            AAStore => 0x53u8.serialize(writer)?,
            BAStore => 0x54u8.serialize(writer)?,
            CAStore => 0x55u8.serialize(writer)?,
            SAStore => 0x56u8.serialize(writer)?,
            Pop => 0x57u8.serialize(writer)?,
            Pop2 => 0x58u8.serialize(writer)?,
            Dup => 0x59u8.serialize(writer)?,
            DupX1 => 0x5au8.serialize(writer)?,
            DupX2 => 0x5bu8.serialize(writer)?,
            Dup2 => 0x5cu8.serialize(writer)?,
            Dup2X1 => 0x5du8.serialize(writer)?,
            Dup2X2 => 0x5eu8.serialize(writer)?,
            Swap => 0x5fu8.serialize(writer)?,
            IAdd => 0x60u8.serialize(writer)?,
            LAdd => 0x61u8.serialize(writer)?,
            FAdd => 0x62u8.serialize(writer)?,
            DAdd => 0x63u8.serialize(writer)?,
            ISub => 0x64u8.serialize(writer)?,
            LSub => 0x65u8.serialize(writer)?,
            FSub => 0x66u8.serialize(writer)?,
            DSub => 0x67u8.serialize(writer)?,
            IMul => 0x68u8.serialize(writer)?,
            LMul => 0x69u8.serialize(writer)?,
            FMul => 0x6au8.serialize(writer)?,
            DMul => 0x6bu8.serialize(writer)?,
            IDiv => 0x6cu8.serialize(writer)?,
            LDiv => 0x6du8.serialize(writer)?,
            FDiv => 0x6eu8.serialize(writer)?,
            DDiv => 0x6fu8.serialize(writer)?,
            IRem => 0x70u8.serialize(writer)?,
            LRem => 0x71u8.serialize(writer)?,
            FRem => 0x72u8.serialize(writer)?,
            DRem => 0x73u8.serialize(writer)?,
            INeg => 0x74u8.serialize(writer)?,
            LNeg => 0x75u8.serialize(writer)?,
            FNeg => 0x76u8.serialize(writer)?,
            DNeg => 0x77u8.serialize(writer)?,
            ISh(ShiftType::Left) => 0x78u8.serialize(writer)?,
            LSh(ShiftType::Left) => 0x79u8.serialize(writer)?,
            ISh(ShiftType::ArithmeticRight) => 0x7au8.serialize(writer)?,
            LSh(ShiftType::ArithmeticRight) => 0x7bu8.serialize(writer)?,
            ISh(ShiftType::LogicalRight) => 0x7cu8.serialize(writer)?,
            LSh(ShiftType::LogicalRight) => 0x7du8.serialize(writer)?,
            IAnd => 0x7eu8.serialize(writer)?,
            LAnd => 0x7fu8.serialize(writer)?,
            IOr => 0x80u8.serialize(writer)?,
            LOr => 0x81u8.serialize(writer)?,
            IXor => 0x82u8.serialize(writer)?,
            LXor => 0x83u8.serialize(writer)?,
            IInc(idx, diff) => match (u8::try_from(*idx), i8::try_from(*diff)) {
                (Ok(b), Ok(d)) => {
                    0x84u8.serialize(writer)?;
                    b.serialize(writer)?;
                    d.serialize(writer)?;
                }
                _ => {
                    0xc4u8.serialize(writer)?;
                    0x84u8.serialize(writer)?;
                    idx.serialize(writer)?;
                    diff.serialize(writer)?;
                }
            },
            I2L => 0x85u8.serialize(writer)?,
            I2F => 0x86u8.serialize(writer)?,
            I2D => 0x87u8.serialize(writer)?,
            L2I => 0x88u8.serialize(writer)?,
            L2F => 0x89u8.serialize(writer)?,
            L2D => 0x8au8.serialize(writer)?,
            F2I => 0x8bu8.serialize(writer)?,
            F2L => 0x8cu8.serialize(writer)?,
            F2D => 0x8du8.serialize(writer)?,
            D2I => 0x8eu8.serialize(writer)?,
            D2L => 0x8fu8.serialize(writer)?,
            D2F => 0x90u8.serialize(writer)?,
            I2B => 0x91u8.serialize(writer)?,
            I2C => 0x92u8.serialize(writer)?,
            I2S => 0x93u8.serialize(writer)?,
            LCmp => 0x94u8.serialize(writer)?,
            FCmp(CompareMode::L) => 0x95u8.serialize(writer)?,
            FCmp(CompareMode::G) => 0x96u8.serialize(writer)?,
            DCmp(CompareMode::L) => 0x97u8.serialize(writer)?,
            DCmp(CompareMode::G) => 0x98u8.serialize(writer)?,
            GetStatic(idx) => with_index(0xb2, idx.0, writer)?,
            PutStatic(idx) => with_index(0xb3, idx.0, writer)?,
            GetField(idx) => with_index(0xb4, idx.0, writer)?,
            PutField(idx) => with_index(0xb5, idx.0, writer)?,
            Invoke(InvokeType::Virtual, idx) => with_index(0xb6, idx.0, writer)?,
            Invoke(InvokeType::Special, idx) => with_index(0xb7, idx.0, writer)?,
            Invoke(InvokeType::Static, idx) => with_index(0xb8, idx.0, writer)?,
            Invoke(InvokeType::Interface(cnt), idx) => {
                with_index(0xb9, idx.0, writer)?;
                cnt.serialize(writer)?;
                0u8.serialize(writer)?;
            }
            InvokeDynamic(idx) => {
                with_index(0xba, idx.0 .0, writer)?;
                0u16.serialize(writer)?;
            }
            New(idx) => with_index(0xbb, idx.0 .0, writer)?,
            NewArray(basetype) => {
                0xbcu8.serialize(writer)?;
                array_type_code(*basetype).serialize(writer)?;
            }
            ANewArray(idx) => with_index(0xbd, idx.0 .0, writer)?,
            ArrayLength => 0xbeu8.serialize(writer)?,
            CheckCast(idx) => with_index(0xc0, idx.0 .0, writer)?,
            InstanceOf(idx) => with_index(0xc1, idx.0 .0, writer)?,
            MonitorEnter => 0xc2u8.serialize(writer)?,
            MonitorExit => 0xc3u8.serialize(writer)?,
            MultiANewArray(idx, dimensions) => {
                with_index(0xc5, idx.0 .0, writer)?;
                dimensions.serialize(writer)?;
            }
        }
        Ok(())
    }
}

/// `atype` operand of `newarray`
pub fn array_type_code(base_type: BaseType) -> u8 {
    match base_type {
        BaseType::Boolean => 4,
        BaseType::Char => 5,
        BaseType::Float => 6,
        BaseType::Double => 7,
        BaseType::Byte => 8,
        BaseType::Short => 9,
        BaseType::Int => 10,
        BaseType::Long => 11,
    }
}

/// Inverse of [`array_type_code`]
pub fn array_type_from_code(code: u8) -> Option<BaseType> {
    Some(match code {
        4 => BaseType::Boolean,
        5 => BaseType::Char,
        6 => BaseType::Float,
        7 => BaseType::Double,
        8 => BaseType::Byte,
        9 => BaseType::Short,
        10 => BaseType::Int,
        11 => BaseType::Long,
        _ => return None,
    })
}

/// Branching JVM bytecode instruction
///
/// The type parameter abstracts over the representation of jump targets: while decoding they are
/// absolute bytecode offsets, in the class model they are [`Label`]s. Conditional branches and
/// `jsr` fall through to the next element when they don't jump.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BranchInstruction<Lbl = Label> {
    If(OrdComparison, Lbl), // covers `ifeq`, `ifne`, `iflt`, `ifge`, `ifgt`, `ifle`
    IfICmp(OrdComparison, Lbl), // covers `if_icmpeq`, `if_icmpne`, `if_icmplt`, ... `if_icmple`
    IfACmp(EqComparison, Lbl), // covers `if_acmpeq`, `if_acmpne`
    IfNull(EqComparison, Lbl), // covers `ifnull`, `ifnonnull`
    Goto(Lbl),                 // covers `goto` and `goto_w`
    Jsr(Lbl),                  // covers `jsr` and `jsr_w`
    Ret(u16),
    TableSwitch {
        /// Jump target if the argument is less than `low` or greater than
        /// `low + targets.len() - 1`
        default: Lbl,

        /// Value associated with the first jump target
        low: i32,

        /// Jump targets
        targets: Vec<Lbl>,
    },
    LookupSwitch {
        /// Jump target if there is no corresponding key
        default: Lbl,

        /// Jump targets (sorted so that the keys are ascending)
        targets: Vec<(i32, Lbl)>,
    },
    IReturn,
    LReturn,
    FReturn,
    DReturn,
    AReturn,
    Return,
    AThrow,
}

impl<Lbl: Copy> BranchInstruction<Lbl> {
    /// Every explicit jump target, in operand order (duplicates included)
    pub fn targets(&self) -> Vec<Lbl> {
        match self {
            BranchInstruction::If(_, lbl)
            | BranchInstruction::IfICmp(_, lbl)
            | BranchInstruction::IfACmp(_, lbl)
            | BranchInstruction::IfNull(_, lbl)
            | BranchInstruction::Goto(lbl)
            | BranchInstruction::Jsr(lbl) => vec![*lbl],
            BranchInstruction::TableSwitch {
                default, targets, ..
            } => {
                let mut all = vec![*default];
                all.extend(targets.iter().copied());
                all
            }
            BranchInstruction::LookupSwitch { default, targets } => {
                let mut all = vec![*default];
                all.extend(targets.iter().map(|(_, lbl)| *lbl));
                all
            }
            _ => vec![],
        }
    }

    /// Can execution continue with the next element?
    pub fn falls_through(&self) -> bool {
        matches!(
            self,
            BranchInstruction::If(_, _)
                | BranchInstruction::IfICmp(_, _)
                | BranchInstruction::IfACmp(_, _)
                | BranchInstruction::IfNull(_, _)
                | BranchInstruction::Jsr(_)
        )
    }

    /// Is this a two-way conditional jump?
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            BranchInstruction::If(_, _)
                | BranchInstruction::IfICmp(_, _)
                | BranchInstruction::IfACmp(_, _)
                | BranchInstruction::IfNull(_, _)
        )
    }

    pub fn is_return(&self) -> bool {
        matches!(
            self,
            BranchInstruction::IReturn
                | BranchInstruction::LReturn
                | BranchInstruction::FReturn
                | BranchInstruction::DReturn
                | BranchInstruction::AReturn
                | BranchInstruction::Return
        )
    }

    /// Same condition, jumping elsewhere
    pub fn map_labels<Lbl2, E>(
        &self,
        mut map_label: impl FnMut(&Lbl) -> std::result::Result<Lbl2, E>,
    ) -> std::result::Result<BranchInstruction<Lbl2>, E> {
        use BranchInstruction::*;
        Ok(match self {
            If(cmp, lbl) => If(*cmp, map_label(lbl)?),
            IfICmp(cmp, lbl) => IfICmp(*cmp, map_label(lbl)?),
            IfACmp(cmp, lbl) => IfACmp(*cmp, map_label(lbl)?),
            IfNull(cmp, lbl) => IfNull(*cmp, map_label(lbl)?),
            Goto(lbl) => Goto(map_label(lbl)?),
            Jsr(lbl) => Jsr(map_label(lbl)?),
            Ret(idx) => Ret(*idx),
            TableSwitch {
                default,
                low,
                targets,
            } => TableSwitch {
                default: map_label(default)?,
                low: *low,
                targets: targets
                    .iter()
                    .map(&mut map_label)
                    .collect::<std::result::Result<_, E>>()?,
            },
            LookupSwitch { default, targets } => LookupSwitch {
                default: map_label(default)?,
                targets: targets
                    .iter()
                    .map(|(key, lbl)| Ok((*key, map_label(lbl)?)))
                    .collect::<std::result::Result<_, E>>()?,
            },
            IReturn => IReturn,
            LReturn => LReturn,
            FReturn => FReturn,
            DReturn => DReturn,
            AReturn => AReturn,
            Return => Return,
            AThrow => AThrow,
        })
    }

    /// Conditional branch with the opposite condition (`None` if this is not a conditional)
    pub fn inverted(&self, target: Lbl) -> Option<BranchInstruction<Lbl>> {
        Some(match self {
            BranchInstruction::If(cmp, _) => BranchInstruction::If(!*cmp, target),
            BranchInstruction::IfICmp(cmp, _) => BranchInstruction::IfICmp(!*cmp, target),
            BranchInstruction::IfACmp(cmp, _) => BranchInstruction::IfACmp(!*cmp, target),
            BranchInstruction::IfNull(cmp, _) => BranchInstruction::IfNull(!*cmp, target),
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShiftType {
    Left,
    LogicalRight,
    ArithmeticRight,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompareMode {
    /// -1 on NaN
    L,

    /// 1 on NaN
    G,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OrdComparison {
    EQ,
    GE,
    GT,
    LE,
    LT,
    NE,
}

impl OrdComparison {
    /// Evaluate the comparison against known operands
    pub fn holds<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            OrdComparison::EQ => lhs == rhs,
            OrdComparison::NE => lhs != rhs,
            OrdComparison::LT => lhs < rhs,
            OrdComparison::LE => lhs <= rhs,
            OrdComparison::GT => lhs > rhs,
            OrdComparison::GE => lhs >= rhs,
        }
    }
}

impl Not for OrdComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            OrdComparison::EQ => OrdComparison::NE,
            OrdComparison::NE => OrdComparison::EQ,
            OrdComparison::LT => OrdComparison::GE,
            OrdComparison::GE => OrdComparison::LT,
            OrdComparison::GT => OrdComparison::LE,
            OrdComparison::LE => OrdComparison::GT,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EqComparison {
    EQ,
    NE,
}

impl Not for EqComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            EqComparison::EQ => EqComparison::NE,
            EqComparison::NE => EqComparison::EQ,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InvokeType {
    Virtual,
    Special,
    Static,
    Interface(u8), // `count` is of total arguments, where `long`/`double` count for 2
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn widths_follow_operands() {
        assert_eq!(Instruction::ILoad(2).width(), 1);
        assert_eq!(Instruction::ILoad(200).width(), 2);
        assert_eq!(Instruction::ILoad(300).width(), 4);
        assert_eq!(Instruction::Ldc(ConstantIndex(255)).width(), 2);
        assert_eq!(Instruction::Ldc(ConstantIndex(256)).width(), 3);
        assert_eq!(Instruction::IInc(1, 200).width(), 6);

        let mut bytes = vec![];
        Instruction::IInc(1, 200).serialize(&mut bytes).unwrap();
        assert_eq!(bytes, vec![0xc4, 0x84, 0, 1, 0, 200]);
    }

    #[test]
    fn branch_helpers() {
        let branch: BranchInstruction<u32> = BranchInstruction::IfICmp(OrdComparison::LT, 7);
        assert!(branch.falls_through());
        assert_eq!(branch.targets(), vec![7]);
        assert_eq!(
            branch.inverted(9),
            Some(BranchInstruction::IfICmp(OrdComparison::GE, 9))
        );

        let switch: BranchInstruction<u32> = BranchInstruction::LookupSwitch {
            default: 1,
            targets: vec![(3, 2), (9, 1)],
        };
        assert!(!switch.falls_through());
        assert_eq!(switch.targets(), vec![1, 2, 1]);
        assert!(OrdComparison::LE.holds(3, 3));
        assert!(!OrdComparison::GT.holds(3, 3));
    }
}
