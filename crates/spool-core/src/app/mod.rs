//! App - アプリケーション層
//!
//! Wiring of the components onto one coordination store.

pub mod builder;

pub use self::builder::{BuildError, Spool, SpoolBuilder};
