//! # scriptforge-error
//!
//! One error type for the whole workspace. An [`Error`] carries:
//!
//! - an [`ErrorKind`] saying what failed (a script, the model, the queue)
//! - an [`ErrorStatus`] saying whether trying again could help
//! - the operation that failed, plus earlier operations it passed through
//! - free-form `key: value` context and an optional wrapped source
//!
//! ```rust
//! use scriptforge_error::{Error, ErrorKind};
//!
//! fn locate() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::ScriptNotFound, "No run_*.py script found")
//!         .with_operation("pipeline::run")
//!         .with_context("dir", "tests/basic"))
//! }
//!
//! let err = locate().unwrap_err();
//! assert_eq!(err.context_value("dir"), Some("tests/basic"));
//! ```
//!
//! Foreign errors are attached with `set_source` rather than converted, except
//! for `std::io::Error` which maps onto the file kinds.

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

pub type Result<T> = std::result::Result<T, Error>;
