//! Deobfuscation of JVM bytecode
//!
//! Classes are read from an archive into a label-based model ([`jvm`]), analyzed ([`analysis`]),
//! rewritten by a pipeline of passes ([`transform`]) driven by the [`engine`], checked by the
//! [`verifier`], and written back out ([`archive`]).
//!
//! ```no_run
//! use untangle::engine::{Engine, PipelineConfig};
//! use untangle::transform::Catalog;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), untangle::engine::EngineError> {
//! let catalog = Catalog::default();
//! let config = PipelineConfig::new(["control-flow", "string-decryption"]);
//! let report = Engine::new(&catalog, config)
//!     .run_file(Path::new("obfuscated.jar"), Path::new("clean.jar"))?;
//! println!("{} classes changed", report.summary.changed);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod archive;
pub mod engine;
pub mod jvm;
pub mod transform;
pub mod util;
pub mod verifier;
