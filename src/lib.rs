//! Post-compilation weaver that bakes Log4j caller locations into JVM class
//! files.
//!
//! Every recognised logging call site is rewritten to read a precomputed
//! `StackTraceElement` from a generated cache class, one per top-level class,
//! instead of walking the stack at run time. Flow tracing and `printf` call
//! sites are additionally redirected to shared message suppliers on the same
//! cache class.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use location_weaver::batch::{BatchContext, BatchOptions, weave};
//! use location_weaver::hierarchy::ClassPath;
//! use location_weaver::registry::Registry;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let classes = Path::new("target/classes");
//! let ctx = BatchContext::new(Registry::log4j_api(), ClassPath::with_roots(&[classes])?);
//! let report = weave(ctx, classes, classes, &BatchOptions::default())?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

pub mod api;
pub mod batch;
pub mod builder;
pub mod cache;
pub mod class_reader;
pub mod class_writer;
pub mod constants;
pub mod convert;
pub mod descriptor;
pub mod error;
pub mod frames;
pub mod hierarchy;
pub mod insn;
pub mod naming;
pub mod nodes;
pub mod opcodes;
pub mod registry;
pub mod rewriter;
pub mod shape;

pub use batch::{BatchContext, BatchOptions, BatchReport, weave};
pub use convert::{Converted, convert};
pub use error::{BatchError, ConvertError};
pub use registry::Registry;
