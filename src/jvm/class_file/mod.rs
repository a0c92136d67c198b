//! Raw class file structures
//!
//! This layer mirrors the binary format closely: constant pool indices stay indices and
//! attributes stay byte blobs unless something asks to decode them. The class model in
//! [`crate::jvm::model`] is built on top of it.

mod attribute;
mod binary_format;
mod class;
mod constants;
mod field;
mod method;
mod version;

pub use attribute::*;
pub use binary_format::*;
pub use class::*;
pub use constants::*;
pub use field::*;
pub use method::*;
pub use version::*;
