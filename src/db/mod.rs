//! User store: pool construction and document queries.
//!
//! - `model`: identifier newtype and raw row shapes returned by queries.
//! - `repo`: SQL-only functions over an explicitly passed pool.
//!
//! Callers import from `tg_bulksender::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{RawIdentifier, SqlIdent, UserChanges};
