use super::code::Label;
use thiserror::Error;

/// Reasons a class cannot be loaded into the model
///
/// All of these surface as `MalformedClass` in the execution report and the archive entry is
/// passed through unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassFormatError {
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("unexpected end of class data")]
    Truncated,

    #[error("{0} unexpected trailing bytes after class data")]
    TrailingBytes(usize),

    #[error("unknown constant pool tag {tag} at index {index}")]
    BadConstantTag { tag: u8, index: u16 },

    #[error("constant pool index {0} is out of range or unusable")]
    BadConstantIndex(u16),

    #[error("constant pool entry {index} is not a {expected}")]
    UnexpectedConstant { index: u16, expected: &'static str },

    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("bytecode offset {0} does not start an instruction")]
    BadCodeOffset(usize),

    #[error("malformed {attribute} attribute: {reason}")]
    BadAttribute {
        attribute: &'static str,
        reason: String,
    },

    #[error("bad descriptor {0:?}")]
    BadDescriptor(String),
}

impl From<std::io::Error> for ClassFormatError {
    fn from(_: std::io::Error) -> Self {
        ClassFormatError::Truncated
    }
}

/// Errors while exporting a model back into class bytes
#[derive(Debug, Error)]
pub enum Error {
    #[error("constant pool overflow at offset {offset}")]
    ConstantPoolOverflow { offset: usize },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("method code is {0} bytes long (the limit is 65535)")]
    MethodCodeOverflow(usize),

    #[error("label {0:?} is referenced but never placed")]
    UnplacedLabel(Label),

    #[error("label {0:?} is placed more than once")]
    DuplicateLabel(Label),

    #[error("too many {0} entries")]
    TooManyEntries(&'static str),

    #[error("no stack map frame for jump target at offset {0}")]
    MissingFrame(usize),

    #[error("bad descriptor {0:?}")]
    BadDescriptor(String),
}

impl From<super::class_file::ConstantPoolOverflow> for Error {
    fn from(overflow: super::class_file::ConstantPoolOverflow) -> Self {
        Error::ConstantPoolOverflow {
            offset: overflow.offset,
        }
    }
}
