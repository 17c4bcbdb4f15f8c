//! # tandem-core — operational transform for plain text
//!
//! The pure half of tandem: no I/O, no clocks, no shared state.
//!
//! ```text
//!  old text ──┐
//!             ├── diff::encode ──► Operation ──► transform / compose ──► apply_to
//!  new text ──┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — `Operation`, its components and `apply_to` / `compose`
//! - [`diff`] — prefix/suffix diff from a before/after text pair
//! - [`transform`] — rebasing one operation over a concurrent one
//!
//! Positions everywhere are char offsets (Unicode scalar values), never bytes.

pub mod diff;
pub mod operation;
pub mod transform;

mod span;

pub use diff::encode;
pub use operation::{Component, Operation, OperationError};
pub use transform::{transform, transform_pair, Side};
