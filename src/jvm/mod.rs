//! Read, manipulate, and write JVM classes
//!
//! There are two layers:
//!
//!   - [`class_file`] mirrors the binary format, with constant pool indices and raw attributes
//!   - [`model`] is what the rest of the crate works with: names are strings, method bodies are
//!     label-based instruction lists (see [`code`]), and interpreted attributes are typed
//!
//! The constant pool is shared between the two layers. It is an append-only arena, so
//! instructions in the model can keep referring to constants by index.
//!
//! ### Simple example
//!
//! Building a class with a single static method returning a constant, exporting it, and reading
//! it back:
//!
//! ```
//! use untangle::jvm::code::{BranchInstruction, Code, Element, Instruction};
//! use untangle::jvm::model::{ClassModel, MethodModel};
//! use untangle::jvm::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut class = ClassModel::new("me/alec/Answer", Some("java/lang/Object"));
//!
//! let mut code = Code::new();
//! code.max_stack = 1;
//! code.elements = vec![
//!     Element::Insn(Instruction::BiPush(42)),
//!     Element::Branch(BranchInstruction::IReturn),
//! ];
//! let mut method = MethodModel::new(
//!     MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
//!     "answer",
//!     "()I",
//! );
//! method.code = Some(code);
//! class.methods.push(method);
//!
//! let bytes: Vec<u8> = class.export()?;
//! let parsed = ClassModel::build(&bytes)?;
//! assert_eq!(parsed.name, "me/alec/Answer");
//! assert_eq!(parsed.methods[0].name, "answer");
//! # Ok(())
//! # }
//! ```

mod access_flags;
pub mod class_file;
pub mod code;
mod descriptors;
mod errors;
mod frame;
pub mod model;
pub mod signatures;

pub use access_flags::*;
pub use class_file::{
    ClassConstantIndex, Constant, ConstantIndex, ConstantPool, ConstantPoolOverflow, HandleKind,
    InvokeDynamicConstantIndex, LoadableConstant, MemberKind, MemberRef,
    NameAndTypeConstantIndex, StringConstantIndex, Utf8ConstantIndex, Version,
};
pub use descriptors::*;
pub use errors::*;
pub use frame::*;
