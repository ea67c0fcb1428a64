//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryStore**: 単一プロセス用の CoordinationStore
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置します：
//! - `spool-redis`: RedisStore

pub mod memory_store;

pub use self::memory_store::InMemoryStore;
