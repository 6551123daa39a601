//! # ホストテーブル
//!
//! ホスト名 → ホストタグ → プロダクト、VIP → プロダクト、プロダクト →
//! ルール表のルックアップを提供します。テーブルは構築後不変で、リロードは
//! 新しいスナップショットへの差し替えとして行われます。

use std::collections::HashMap;
use std::net::IpAddr;

use crate::condition::Condition;
use crate::proxy::request::GatewayRequest;

use super::trie::{reverse_labels, Trie};

/// ルーティングエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// プロダクトが見つからない
    NoProduct,
    /// プロダクトのルール表が無い
    NoProductRule,
    /// どのルールにも一致しない
    NoRuleMatch,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoProduct => "no product found",
            Self::NoProductRule => "no route rule found for product",
            Self::NoRuleMatch => "no rule match for this req",
        };
        f.write_str(s)
    }
}

impl std::error::Error for RouteError {}

/// トライの終端: プロダクトとホストタグ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRoute {
    pub product: String,
    pub tag: String,
}

/// ルール 1 本: 条件式と転送先クラスタ
pub struct RouteRule {
    pub cond: Condition,
    pub cluster_name: String,
}

/// 設定バージョン
#[derive(Debug, Clone, Default)]
pub struct Versions {
    pub host_tag: String,
    pub vip: String,
    pub product_route: String,
}

/// テーブルサイズ (ステータス表示用)
#[derive(Debug, Clone, Default)]
pub struct TableStatus {
    pub host_table_size: usize,
    pub host_tag_table_size: usize,
    pub vip_table_size: usize,
    pub product_route_table_size: usize,
}

/// ホストテーブル本体
pub struct HostTable {
    versions: Versions,

    /// ホスト名 → タグ
    host_table: HashMap<String, String>,
    /// タグ → プロダクト
    host_tag_table: HashMap<String, String>,
    /// VIP → プロダクト
    vip_table: HashMap<IpAddr, String>,
    default_product: String,

    host_trie: Trie<HostRoute>,
    /// プロダクト → 順序付きルール表
    product_rules: HashMap<String, Vec<RouteRule>>,
}

impl HostTable {
    pub fn new(
        versions: Versions,
        host_table: HashMap<String, String>,
        host_tag_table: HashMap<String, String>,
        vip_table: HashMap<IpAddr, String>,
        default_product: String,
        product_rules: HashMap<String, Vec<RouteRule>>,
    ) -> Self {
        let host_trie = build_host_trie(&host_table, &host_tag_table);
        Self {
            versions,
            host_table,
            host_tag_table,
            vip_table,
            default_product,
            host_trie,
            product_rules,
        }
    }

    /// ホスト名 (無ければ VIP、さらにデフォルト) からプロダクトを引く
    ///
    /// 結果はリクエストの route フィールドに書き込まれます。
    pub fn lookup_host_tag_and_product(&self, req: &mut GatewayRequest) -> Result<(), RouteError> {
        let found = self
            .find_host_route(&req.host)
            .or_else(|| req.vip.and_then(|vip| self.find_vip_route(vip)));

        let found = match found {
            Some(route) => route,
            None if !self.default_product.is_empty() => HostRoute {
                product: self.default_product.clone(),
                tag: String::new(),
            },
            None => return Err(RouteError::NoProduct),
        };

        req.route.host_tag = found.tag;
        req.route.product = found.product;
        Ok(())
    }

    /// プロダクトのルール表を評価してクラスタを決める (先勝ち)
    pub fn lookup_cluster(&self, req: &mut GatewayRequest) -> Result<(), RouteError> {
        let rules = self
            .product_rules
            .get(&req.route.product)
            .ok_or(RouteError::NoProductRule)?;

        for rule in rules {
            if rule.cond.matches(req) {
                req.route.cluster_name = rule.cluster_name.clone();
                return Ok(());
            }
        }
        Err(RouteError::NoRuleMatch)
    }

    /// ホスト名のみからプロダクトを引く (ステータス・デバッグ用)
    pub fn lookup_product(&self, host: &str) -> Option<String> {
        self.find_host_route(&host.to_ascii_lowercase())
            .map(|r| r.product)
    }

    pub fn versions(&self) -> &Versions {
        &self.versions
    }

    pub fn status(&self) -> TableStatus {
        TableStatus {
            host_table_size: self.host_table.len(),
            host_tag_table_size: self.host_tag_table.len(),
            vip_table_size: self.vip_table.len(),
            product_route_table_size: self.product_rules.len(),
        }
    }

    fn find_host_route(&self, host: &str) -> Option<HostRoute> {
        if self.host_trie.is_empty() {
            return None;
        }
        self.host_trie.get(&reverse_labels(host)).cloned()
    }

    fn find_vip_route(&self, vip: IpAddr) -> Option<HostRoute> {
        self.vip_table.get(&vip).map(|product| HostRoute {
            product: product.clone(),
            tag: String::new(),
        })
    }
}

/// ホスト表からトライを構築する
fn build_host_trie(
    host_table: &HashMap<String, String>,
    host_tag_table: &HashMap<String, String>,
) -> Trie<HostRoute> {
    let mut trie = Trie::new();
    for (host, tag) in host_table {
        let host = host.to_ascii_lowercase();
        let product = match host_tag_table.get(tag) {
            Some(p) => p.clone(),
            None => continue,
        };
        trie.insert(
            &reverse_labels(&host),
            HostRoute {
                product,
                tag: tag.clone(),
            },
        );
    }
    trie
}
