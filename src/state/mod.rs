//! Runtime state
//!
//! `JobContext` holds the collaborators every processor uses; `Runtime`
//! owns the workers and background loops built on top of it.

mod context;
mod runtime;

pub use context::JobContext;
pub use runtime::Runtime;
