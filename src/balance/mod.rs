//! # クラスタ内ロードバランス (GSLB)
//!
//! サブクラスタ → バックエンドの二層選択と健全性管理。

pub mod backend;
pub mod gslb;
pub mod subcluster;

pub use backend::Backend;
pub use gslb::{BalanceError, BalanceMode, ClusterBalancer, HashStrategy};
pub use subcluster::SubCluster;
