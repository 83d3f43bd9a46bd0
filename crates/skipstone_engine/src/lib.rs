//! Incremental build avoidance for code generators.
//!
//! Given a set of inputs selected by include/exclude patterns, a
//! configuration fingerprint, and the persisted record of the previous
//! build, this crate answers which inputs must be reprocessed and which
//! previously produced outputs are now obsolete or orphaned, then reconciles
//! the filesystem: superfluous outputs are deleted, new state is persisted
//! atomically, and byte-identical output writes leave files untouched.
//!
//! The usual shape of a build:
//!
//! ```no_run
//! use skipstone_engine::{BuildManager, PathSet};
//! use std::io::Write;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), skipstone_engine::BuildError> {
//! let manager = BuildManager::new();
//! let ctx = manager.new_context(Path::new("out"), Path::new(".state"), "my-generator")?;
//!
//! let paths = PathSet::new("src").with_includes(["**/*.model"]);
//! let digest = ctx.new_digester()?.string("target=v2").finish();
//! ctx.set_configuration(digest.as_bytes())?;
//!
//! for rel in ctx.get_inputs(&paths)? {
//!     let input = Path::new("src").join(&rel);
//!     let output = Path::new("out").join(&rel).with_extension("gen");
//!     let mut stream = ctx.new_output_stream(&output)?;
//!     stream.write_all(b"...generated...").map_err(|e| skipstone_engine::BuildError::io(&output, e))?;
//!     stream.close()?;
//!     ctx.add_output(Some(&input), &output)?;
//! }
//! ctx.commit()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod file_state;
pub mod manager;
pub mod output;
pub mod pathset;
pub mod resolver;
pub mod state;

pub use context::BuildContext;
pub use error::BuildError;
pub use file_state::FileState;
pub use manager::{BuildListener, BuildManager, LogListener};
pub use output::IncrementalOutputStream;
pub use pathset::PathSet;
pub use resolver::ResolvedPath;
pub use state::{BuildState, InputRecord};

pub use skipstone_diagnostics::{Message, Severity};
