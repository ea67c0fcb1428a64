//! spool-core
//!
//! Distributed task execution on top of a shared coordination store.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, status, result, errors）
//! - **ports**: 抽象化レイヤー（CoordinationStore, Clock）
//! - **impls**: 実装（InMemoryStore: 開発・テスト用）
//! - **queue**: 優先度付きキュー
//! - **rate_limit**: sliding-window rate limiter
//! - **retry**: backoff policy and lock-guarded retry coordination
//! - **results**: result records keyed by callback id
//! - **runtime**: handler registry
//! - **worker**: worker pool
//! - **app**: SpoolBuilder / Spool facade

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod rate_limit;
pub mod results;
pub mod retry;
pub mod runtime;
pub mod worker;

pub use self::app::{Spool, SpoolBuilder};
pub use self::config::SpoolConfig;
pub use self::error::SpoolError;
