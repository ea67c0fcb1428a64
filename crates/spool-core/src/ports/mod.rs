//! Ports - 抽象化レイヤー
//!
//! Hexagonal "ports": the coordination store every component is built on, and
//! the clock used for window scoring and result timestamps.

pub mod clock;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::store::{CoordinationStore, ScoredMember, StoreError, WindowAdmission, WindowCount};
