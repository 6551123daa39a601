//! # ルーティング層
//!
//! ホスト名 / VIP からプロダクトを、条件式ルールからクラスタを解決します。

pub mod host_table;
pub mod trie;

pub use host_table::{HostRoute, HostTable, RouteError, RouteRule, TableStatus, Versions};
