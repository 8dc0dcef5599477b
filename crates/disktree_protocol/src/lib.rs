//! Shared protocol types for disktree.
//!
//! Everything that crosses a crate or process boundary lives here: the
//! canonical [`Uri`] type, snapshot/catalog records, the planner's [`View`]
//! response, the error taxonomy, and the worker wire protocol.

mod uri;
pub mod exit;
pub mod types;
pub mod wire;

pub use types::*;
pub use uri::{Scheme, Uri, UriError};
