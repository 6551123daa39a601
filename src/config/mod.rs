//! # 設定
//!
//! `sekisho.toml` の読み込み・検証と、実行時スナップショットの構築を行い
//! ます。検証はすべてロード時に完結し、実行時に設定エラーは発生しません。
//! ホットリロードは新しいスナップショットを構築して原子的に差し替えます。
//! リクエスト処理は入口で Arc を 1 回クローンし、以降そのスナップショット
//! だけを参照します。

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::balance::{Backend, BalanceMode, ClusterBalancer, HashStrategy, SubCluster};
use crate::condition::Condition;
use crate::ipdict::IpItems;
use crate::route::{HostTable, RouteRule, Versions};

// ====================
// ファイル構造 (serde)
// ====================

#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub server: ServerSection,
    pub tls: Option<TlsSection>,
    #[serde(default)]
    pub http2: Http2Section,
    pub routing: RoutingSection,
    #[serde(default)]
    pub trusted_proxies: TrustedProxiesSection,
    #[serde(default)]
    pub clusters: HashMap<String, ClusterSection>,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    pub listen: String,
    /// 0 は CPU コア数
    #[serde(default)]
    pub worker_threads: usize,
}

#[derive(Debug, Deserialize)]
pub struct TlsSection {
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub http2_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct Http2Section {
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
    #[serde(default = "default_initial_window_size")]
    pub initial_window_size: u32,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    /// コネクション受信ウィンドウを 2^30 へ拡張する
    #[serde(default)]
    pub large_window: bool,
}

impl Default for Http2Section {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            initial_window_size: default_initial_window_size(),
            max_frame_size: default_max_frame_size(),
            large_window: false,
        }
    }
}

fn default_max_concurrent_streams() -> u32 {
    200
}
fn default_initial_window_size() -> u32 {
    65535
}
fn default_max_frame_size() -> u32 {
    16384
}

#[derive(Debug, Deserialize)]
pub struct RoutingSection {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub default_product: String,
    #[serde(default)]
    pub host_rules: Vec<HostRuleEntry>,
    #[serde(default)]
    pub tag_rules: Vec<TagRuleEntry>,
    #[serde(default)]
    pub vip_rules: Vec<VipRuleEntry>,
    /// プロダクト → 順序付きルール
    #[serde(default)]
    pub products: HashMap<String, Vec<ProductRuleEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct HostRuleEntry {
    pub hostname: String,
    pub tag: String,
}

#[derive(Debug, Deserialize)]
pub struct TagRuleEntry {
    pub tag: String,
    pub product: String,
}

#[derive(Debug, Deserialize)]
pub struct VipRuleEntry {
    pub vip: String,
    pub product: String,
}

#[derive(Debug, Deserialize)]
pub struct ProductRuleEntry {
    pub cond: String,
    pub cluster: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TrustedProxiesSection {
    #[serde(default)]
    pub singles: Vec<String>,
    #[serde(default)]
    pub ranges: Vec<IpRangeEntry>,
}

#[derive(Debug, Deserialize)]
pub struct IpRangeEntry {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Deserialize)]
pub struct ClusterSection {
    // バックエンド側タイムアウト (ms)
    pub timeout_conn_srv: u64,
    pub timeout_response_header: u64,
    // クライアント側タイムアウト (ms)
    pub timeout_read_client: u64,
    pub timeout_read_client_again: u64,
    pub timeout_write_client: u64,

    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns_per_host: usize,
    #[serde(default = "default_retry_level")]
    pub retry_level: String,
    #[serde(default)]
    pub cross_retry: u32,
    #[serde(default)]
    pub retry_max: u32,
    #[serde(default = "default_balance_mode")]
    pub balance_mode: String,

    #[serde(default = "default_req_write_buffer_size")]
    pub req_write_buffer_size: usize,
    #[serde(default)]
    pub req_flush_interval: u64,
    #[serde(default = "default_res_flush_interval")]
    pub res_flush_interval: u64,
    #[serde(default)]
    pub cancel_on_client_close: bool,

    #[serde(default)]
    pub hash: HashSection,
    pub check: CheckSection,
    #[serde(default)]
    pub subclusters: Vec<SubclusterSection>,
}

fn default_max_idle_conns() -> usize {
    2
}
fn default_retry_level() -> String {
    "ConnectOnly".to_string()
}
fn default_balance_mode() -> String {
    "WRR".to_string()
}
fn default_req_write_buffer_size() -> usize {
    512
}
fn default_res_flush_interval() -> u64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct HashSection {
    #[serde(default = "default_hash_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub session_sticky: bool,
}

impl Default for HashSection {
    fn default() -> Self {
        Self {
            strategy: default_hash_strategy(),
            header: None,
            session_sticky: false,
        }
    }
}

fn default_hash_strategy() -> String {
    "ClientIpOnly".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CheckSection {
    #[serde(default = "default_check_schem")]
    pub schem: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    /// 100..599 で一致、0 は任意、1..31 は百番台クラスのビットマスク
    #[serde(default = "default_check_status_code")]
    pub status_code: i64,
    pub fail_num: u32,
    #[serde(default = "default_check_succ_num")]
    pub succ_num: u32,
    #[serde(default = "default_check_timeout")]
    pub check_timeout: u64,
    pub check_interval: u64,
}

fn default_check_schem() -> String {
    "http".to_string()
}
fn default_check_status_code() -> i64 {
    200
}
fn default_check_succ_num() -> u32 {
    1
}
fn default_check_timeout() -> u64 {
    1000
}

#[derive(Debug, Deserialize)]
pub struct SubclusterSection {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub backends: Vec<BackendSection>,
}

#[derive(Debug, Deserialize)]
pub struct BackendSection {
    pub name: String,
    pub addr: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

// ====================
// 実行時型
// ====================

/// リトライレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLevel {
    /// 接続失敗のみリトライする
    ConnectOnly,
    /// 接続失敗に加え、ボディ未送出の GET もリトライする
    ConnectOrGetBody,
}

/// ヘルスチェック方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckScheme {
    Http,
    Tcp,
}

/// ヘルスチェック設定 (実行時)
#[derive(Debug, Clone)]
pub struct CheckParams {
    pub schem: CheckScheme,
    pub uri: String,
    pub host: Option<String>,
    pub status_code: i64,
    pub fail_num: u32,
    pub succ_num: u32,
    pub check_timeout: Duration,
    pub check_interval: Duration,
}

/// ヘルスチェックのステータスコード照合
///
/// - 100..=599: その値へ完全一致
/// - 0: 任意のコードを許容
/// - 1..=31: 5 ビットのクラスマスク (bit0=1xx … bit4=5xx)
pub fn match_status_code(got: u16, expect: i64) -> bool {
    match expect {
        0 => true,
        100..=599 => got as i64 == expect,
        1..=31 => {
            if !(100..600).contains(&got) {
                return false;
            }
            let class_bit = 1i64 << (got as i64 / 100 - 1);
            expect & class_bit != 0
        }
        _ => false,
    }
}

/// クラスタの実行時パラメータ
#[derive(Debug, Clone)]
pub struct ClusterParams {
    pub timeout_conn_srv: Duration,
    pub timeout_response_header: Duration,
    pub timeout_read_client: Duration,
    pub timeout_read_client_again: Duration,
    pub timeout_write_client: Duration,
    pub max_idle_conns_per_host: usize,
    pub retry_level: RetryLevel,
    pub req_write_buffer_size: usize,
    pub req_flush_interval: Duration,
    pub res_flush_interval: Duration,
    pub cancel_on_client_close: bool,
    pub check: CheckParams,
}

/// クラスタ 1 つ分の実行時状態
pub struct ClusterRuntime {
    pub params: ClusterParams,
    pub balancer: ClusterBalancer,
}

/// 不変スナップショット
///
/// リロードごとに丸ごと作り直し、ポインタ差し替えで公開します。
pub struct Snapshot {
    pub version: String,
    pub host_table: HostTable,
    pub clusters: HashMap<String, Arc<ClusterRuntime>>,
    pub trusted_proxies: IpItems,
}

/// スナップショットの原子的な差し替え点
pub struct SnapshotHolder {
    inner: RwLock<Arc<Snapshot>>,
}

impl SnapshotHolder {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// 現在のスナップショットを取得する (リクエスト入口で 1 回だけ呼ぶ)
    pub fn load(&self) -> Arc<Snapshot> {
        self.inner.read().expect("snapshot lock poisoned").clone()
    }

    /// 新しいスナップショットへ差し替える。進行中のリクエストは古い方を
    /// 参照し続ける。
    pub fn swap(&self, snapshot: Snapshot) {
        *self.inner.write().expect("snapshot lock poisoned") = Arc::new(snapshot);
    }
}

// ====================
// ロードと検証
// ====================

impl FileConfig {
    /// ファイルから読み込み、検証まで行う
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: FileConfig = toml::from_str(&text).context("parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.server
            .listen
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("invalid listen address {}", self.server.listen))?;

        // ルールが参照するクラスタはすべて定義されていること
        for (product, rules) in &self.routing.products {
            if rules.is_empty() {
                bail!("product {} has an empty rule list", product);
            }
            for rule in rules {
                if !self.clusters.contains_key(&rule.cluster) {
                    bail!(
                        "product {} references unknown cluster {}",
                        product,
                        rule.cluster
                    );
                }
            }
        }

        // タグ表の整合
        for host_rule in &self.routing.host_rules {
            if !self
                .routing
                .tag_rules
                .iter()
                .any(|t| t.tag == host_rule.tag)
            {
                bail!(
                    "host rule {} references unknown tag {}",
                    host_rule.hostname,
                    host_rule.tag
                );
            }
        }

        for (name, cluster) in &self.clusters {
            cluster
                .validate()
                .with_context(|| format!("cluster {}", name))?;
        }

        Ok(())
    }
}

impl ClusterSection {
    fn validate(&self) -> anyhow::Result<()> {
        match self.retry_level.as_str() {
            "ConnectOnly" | "ConnectOrGetBody" => {}
            other => bail!("unknown RetryLevel {}", other),
        }
        match self.balance_mode.to_ascii_uppercase().as_str() {
            "WRR" | "WLC" => {}
            other => bail!("unsupported balance mode {}", other),
        }

        match self.hash.strategy.as_str() {
            "ClientIpOnly" => {}
            "ClientIdOnly" | "ClientIdPreferred" => {
                let header = self
                    .hash
                    .header
                    .as_deref()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("hash strategy requires a HashHeader"))?;
                if let Some((_, key)) = header.split_once(':') {
                    if key.trim().is_empty() {
                        bail!("invalid cookie HashHeader {}", header);
                    }
                }
            }
            other => bail!("unknown HashStrategy {}", other),
        }

        match self.check.schem.as_str() {
            "http" => {
                let uri = self
                    .check
                    .uri
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("http check requires Uri"))?;
                if !uri.starts_with('/') {
                    bail!("check Uri should start with '/'");
                }
                let code = self.check.status_code;
                if !(code == 0 || (100..=599).contains(&code) || (1..=31).contains(&code)) {
                    bail!("check status code {} out of range", code);
                }
            }
            "tcp" => {}
            other => bail!("check schem should be http/tcp, got {}", other),
        }
        if self.check.succ_num < 1 {
            bail!("check SuccNum should be bigger than 0");
        }
        if self.check.fail_num < 1 {
            bail!("check FailNum should be bigger than 0");
        }

        for sc in &self.subclusters {
            if sc.backends.is_empty() {
                bail!("subcluster {} has no backends", sc.name);
            }
        }

        Ok(())
    }

    fn to_runtime(&self, name: &str) -> anyhow::Result<ClusterRuntime> {
        let ms = Duration::from_millis;

        let check = CheckParams {
            schem: if self.check.schem == "tcp" {
                CheckScheme::Tcp
            } else {
                CheckScheme::Http
            },
            uri: self.check.uri.clone().unwrap_or_default(),
            host: self.check.host.clone(),
            status_code: self.check.status_code,
            fail_num: self.check.fail_num,
            succ_num: self.check.succ_num,
            check_timeout: ms(self.check.check_timeout),
            check_interval: ms(self.check.check_interval),
        };

        let params = ClusterParams {
            timeout_conn_srv: ms(self.timeout_conn_srv),
            timeout_response_header: ms(self.timeout_response_header),
            timeout_read_client: ms(self.timeout_read_client),
            timeout_read_client_again: ms(self.timeout_read_client_again),
            timeout_write_client: ms(self.timeout_write_client),
            max_idle_conns_per_host: self.max_idle_conns_per_host,
            retry_level: if self.retry_level == "ConnectOrGetBody" {
                RetryLevel::ConnectOrGetBody
            } else {
                RetryLevel::ConnectOnly
            },
            req_write_buffer_size: self.req_write_buffer_size,
            req_flush_interval: ms(self.req_flush_interval),
            res_flush_interval: ms(self.res_flush_interval),
            cancel_on_client_close: self.cancel_on_client_close,
            check: check.clone(),
        };

        let subclusters = self
            .subclusters
            .iter()
            .map(|sc| {
                let backends = sc
                    .backends
                    .iter()
                    .map(|b| {
                        Arc::new(Backend::new(
                            b.name.clone(),
                            b.addr.clone(),
                            b.port,
                            sc.name.clone(),
                            b.weight,
                            check.fail_num,
                            check.succ_num,
                        ))
                    })
                    .collect();
                Arc::new(SubCluster::new(sc.name.clone(), sc.weight, backends))
            })
            .collect();

        let balancer = ClusterBalancer {
            cluster_name: name.to_string(),
            subclusters,
            balance_mode: if self.balance_mode.eq_ignore_ascii_case("WLC") {
                BalanceMode::Wlc
            } else {
                BalanceMode::Wrr
            },
            hash_strategy: match self.hash.strategy.as_str() {
                "ClientIdOnly" => HashStrategy::ClientIdOnly,
                "ClientIdPreferred" => HashStrategy::ClientIdPreferred,
                _ => HashStrategy::ClientIpOnly,
            },
            hash_header: self.hash.header.clone(),
            session_sticky: self.hash.session_sticky,
            retry_max: self.retry_max,
            cross_retry: self.cross_retry,
        };

        Ok(ClusterRuntime { params, balancer })
    }
}

/// 検証済み設定からスナップショットを構築する
pub fn build_snapshot(config: &FileConfig) -> anyhow::Result<Snapshot> {
    // ルーティングテーブル
    let mut host_table = HashMap::new();
    for rule in &config.routing.host_rules {
        host_table.insert(rule.hostname.clone(), rule.tag.clone());
    }
    let mut host_tag_table = HashMap::new();
    for rule in &config.routing.tag_rules {
        host_tag_table.insert(rule.tag.clone(), rule.product.clone());
    }
    let mut vip_table = HashMap::new();
    for rule in &config.routing.vip_rules {
        let vip: IpAddr = rule
            .vip
            .parse()
            .with_context(|| format!("invalid vip {}", rule.vip))?;
        vip_table.insert(vip, rule.product.clone());
    }

    let mut product_rules = HashMap::new();
    for (product, rules) in &config.routing.products {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let cond = Condition::build(&rule.cond).map_err(|e| {
                anyhow::anyhow!("product {} rule {:?}: {}", product, rule.cond, e)
            })?;
            compiled.push(RouteRule {
                cond,
                cluster_name: rule.cluster.clone(),
            });
        }
        product_rules.insert(product.clone(), compiled);
    }

    let versions = Versions {
        host_tag: config.routing.version.clone(),
        vip: config.routing.version.clone(),
        product_route: config.routing.version.clone(),
    };

    let host_table = HostTable::new(
        versions,
        host_table,
        host_tag_table,
        vip_table,
        config.routing.default_product.clone(),
        product_rules,
    );

    // クラスタ
    let mut clusters = HashMap::new();
    for (name, section) in &config.clusters {
        clusters.insert(name.clone(), Arc::new(section.to_runtime(name)?));
    }

    // 信頼プロキシ集合
    let mut trusted = IpItems::new();
    for single in &config.trusted_proxies.singles {
        let ip: IpAddr = single
            .parse()
            .with_context(|| format!("invalid trusted proxy ip {}", single))?;
        trusted.insert_singleton(ip);
    }
    for range in &config.trusted_proxies.ranges {
        let start: IpAddr = range
            .start
            .parse()
            .with_context(|| format!("invalid range start {}", range.start))?;
        let end: IpAddr = range
            .end
            .parse()
            .with_context(|| format!("invalid range end {}", range.end))?;
        trusted
            .insert_range(start, end)
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    trusted.finalize();
    trusted.version = config.routing.version.clone();

    Ok(Snapshot {
        version: config.routing.version.clone(),
        host_table,
        clusters,
        trusted_proxies: trusted,
    })
}
