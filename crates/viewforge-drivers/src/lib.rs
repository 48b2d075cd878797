#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Reference `Driver` implementations for `viewforge-core`: a filesystem
//! driver for the `"filesystem"` routing target, and a scriptable mock
//! driver for exercising the supervision and backoff test suites.

mod deploy;
mod filesystem;
mod mock;

pub use filesystem::FilesystemDriver;
pub use mock::{scripted_factory, MockDriver, ScriptedOutcome};
