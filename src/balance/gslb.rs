//! # GSLB バランサ
//!
//! クラスタ内の二層選択を行います。第 1 層でサブクラスタを重み比例
//! (WRR または WLC) で選び、第 2 層でサブクラスタ内のバックエンドを
//! ラウンドロビンまたはクライアントキーのハッシュで選びます。
//!
//! リトライは試行回数から導出します: 試行 (retry_max + 1) 回ごとに 1 ラウンド
//! とし、ラウンドが変わるときサブクラスタを乗り換えます (クラスタ跨ぎ
//! リトライ)。ラウンド数が cross_retry を超えたら選択不能です。

use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::ipdict::canonical_ip;
use crate::proxy::request::GatewayRequest;

use super::backend::Backend;
use super::subcluster::SubCluster;

/// 第 1 層の選択方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceMode {
    /// 重み付きラウンドロビン
    Wrr,
    /// 重み付き最小接続数
    Wlc,
}

/// 第 2 層のハッシュキー戦略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStrategy {
    /// クライアント ID ヘッダーのみ (無ければクライアント IP)
    ClientIdOnly,
    /// クライアント IP のみ
    ClientIpOnly,
    /// クライアント ID を優先し、無ければ IP
    ClientIdPreferred,
}

/// バランス不能エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceError {
    /// 健全なバックエンドが存在しない
    NoBackend,
    /// クラスタ跨ぎリトライの上限超過
    CrossRetryExceeded,
}

impl std::fmt::Display for BalanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoBackend => f.write_str("no healthy backend available"),
            Self::CrossRetryExceeded => f.write_str("cross-subcluster retry exceeded"),
        }
    }
}

impl std::error::Error for BalanceError {}

/// クラスタ 1 つ分のバランサ
pub struct ClusterBalancer {
    pub cluster_name: String,
    pub subclusters: Vec<Arc<SubCluster>>,
    pub balance_mode: BalanceMode,
    pub hash_strategy: HashStrategy,
    /// クライアント ID の取り出し元。"Cookie:KEY" 形式で Cookie も指せる。
    pub hash_header: Option<String>,
    pub session_sticky: bool,
    /// サブクラスタ内リトライ上限
    pub retry_max: u32,
    /// クラスタ跨ぎリトライ上限
    pub cross_retry: u32,
}

impl ClusterBalancer {
    /// リクエストにバックエンドを割り当てる
    ///
    /// `req.retry_count` が現在の試行番号 (0 始まり) を示します。ラウンドが
    /// 進んでいた場合は `req.stat.cross_cluster` を立てます。
    pub fn balance(&self, req: &mut GatewayRequest) -> Result<Arc<Backend>, BalanceError> {
        if self.subclusters.is_empty() {
            return Err(BalanceError::NoBackend);
        }

        let attempt = req.retry_count;
        let per_round = self.retry_max + 1;
        let round = attempt / per_round;
        if round > self.cross_retry {
            return Err(BalanceError::CrossRetryExceeded);
        }

        let failed = req.backend.clone();
        let current_subcluster = failed.as_ref().map(|b| b.subcluster.clone());

        let subcluster = if attempt == 0 || current_subcluster.is_none() {
            self.pick_subcluster(None)?
        } else if round == (attempt - 1) / per_round {
            // 同一ラウンド内はサブクラスタを維持する
            let name = current_subcluster.as_deref().unwrap();
            self.subclusters
                .iter()
                .find(|sc| sc.name == name)
                .cloned()
                .ok_or(BalanceError::NoBackend)?
        } else {
            // ラウンドが進んだ: 別サブクラスタへ
            req.stat.cross_cluster = true;
            self.pick_subcluster(current_subcluster.as_deref())?
        };

        let backend = self.pick_backend(&subcluster, req, failed.as_ref())?;
        Ok(backend)
    }

    /// 第 1 層: サブクラスタ選択
    fn pick_subcluster(&self, exclude: Option<&str>) -> Result<Arc<SubCluster>, BalanceError> {
        let candidates: Vec<&Arc<SubCluster>> = self
            .subclusters
            .iter()
            .filter(|sc| sc.healthy_count() > 0)
            .filter(|sc| Some(sc.name.as_str()) != exclude)
            .collect();

        // 除外で空になるなら除外なしで再評価する
        let candidates = if candidates.is_empty() {
            self.subclusters
                .iter()
                .filter(|sc| sc.healthy_count() > 0)
                .collect::<Vec<_>>()
        } else {
            candidates
        };

        if candidates.is_empty() {
            return Err(BalanceError::NoBackend);
        }

        let picked = match self.balance_mode {
            BalanceMode::Wrr => {
                // smooth WRR: 現在重みに自重を足し、最大のものを選んで総重みを引く
                let total: i64 = candidates.iter().map(|sc| sc.weight as i64).sum();
                let best = candidates
                    .iter()
                    .map(|sc| (sc.wrr_advance(), *sc))
                    .max_by_key(|(current, _)| *current)
                    .map(|(_, sc)| sc)
                    .unwrap();
                best.wrr_settle(total);
                best
            }
            BalanceMode::Wlc => candidates
                .iter()
                .min_by_key(|sc| {
                    // 重みあたりの接続数が最小のサブクラスタ
                    sc.total_conns() * 1000 / sc.weight as i64
                })
                .copied()
                .unwrap(),
        };

        Ok(Arc::clone(picked))
    }

    /// 第 2 層: バックエンド選択
    fn pick_backend(
        &self,
        subcluster: &SubCluster,
        req: &GatewayRequest,
        exclude: Option<&Arc<Backend>>,
    ) -> Result<Arc<Backend>, BalanceError> {
        let key = self.hash_key(req);

        let picked = match key {
            Some(key) if self.session_sticky => subcluster.pick_sticky(&key, exclude),
            Some(key) => subcluster.pick_hash_mod(xxh3_64(&key), exclude),
            None => subcluster.pick_round_robin(exclude),
        };

        picked.ok_or(BalanceError::NoBackend)
    }

    /// ハッシュキーを構成する
    ///
    /// 戦略がハッシュ系でヘッダー/Cookie が無い場合はクライアント IP の
    /// 16 バイト正規形 (IPv4-mapped) へフォールバックします。
    fn hash_key(&self, req: &GatewayRequest) -> Option<Vec<u8>> {
        match self.hash_strategy {
            HashStrategy::ClientIpOnly => Some(canonical_ip(req.client_ip).to_vec()),
            HashStrategy::ClientIdOnly | HashStrategy::ClientIdPreferred => {
                if let Some(id) = self.client_id(req) {
                    return Some(id);
                }
                Some(canonical_ip(req.client_ip).to_vec())
            }
        }
    }

    fn client_id(&self, req: &GatewayRequest) -> Option<Vec<u8>> {
        let header = self.hash_header.as_deref()?;
        match header.split_once(':') {
            Some(("Cookie", key)) | Some(("cookie", key)) => {
                req.cookie(key.trim()).map(|v| v.as_bytes().to_vec())
            }
            _ => req.header(header).map(|v| v.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, subcluster: &str) -> Arc<Backend> {
        Arc::new(Backend::new(name, "10.0.0.1", 8080, subcluster, 1, 3, 1))
    }

    fn balancer(retry_max: u32, cross_retry: u32) -> ClusterBalancer {
        let bj = Arc::new(SubCluster::new(
            "bj",
            2,
            vec![backend("bj-0", "bj"), backend("bj-1", "bj")],
        ));
        let gz = Arc::new(SubCluster::new("gz", 1, vec![backend("gz-0", "gz")]));
        ClusterBalancer {
            cluster_name: "portal-api".into(),
            subclusters: vec![bj, gz],
            balance_mode: BalanceMode::Wrr,
            hash_strategy: HashStrategy::ClientIpOnly,
            hash_header: None,
            session_sticky: false,
            retry_max,
            cross_retry,
        }
    }

    fn req() -> GatewayRequest {
        GatewayRequest::new(
            "GET".into(),
            "/".into(),
            "https".into(),
            "x.com".into(),
            "HTTP/2.0",
            vec![],
            vec![],
            "203.0.113.7".parse().unwrap(),
            31000,
        )
    }

    #[test]
    fn test_wrr_weight_proportional() {
        let bal = balancer(0, 0);
        let mut bj = 0;
        let mut gz = 0;
        for _ in 0..30 {
            let mut r = req();
            // ハッシュ固定を避けるためラウンドロビンにする
            let sc = bal.pick_subcluster(None).unwrap();
            let b = sc.pick_round_robin(None).unwrap();
            r.backend = Some(b.clone());
            match b.subcluster.as_str() {
                "bj" => bj += 1,
                _ => gz += 1,
            }
        }
        // 重み 2:1 の比で選ばれる
        assert_eq!(bj, 20);
        assert_eq!(gz, 10);
    }

    #[test]
    fn test_retry_stays_in_subcluster_until_round_ends() {
        let bal = balancer(2, 1);
        let mut r = req();

        let first = bal.balance(&mut r).unwrap();
        let first_subcluster = first.subcluster.clone();
        r.backend = Some(first);

        // retry_max = 2 なのでラウンド内の残り 2 試行は同じサブクラスタ
        for attempt in 1..=2 {
            r.retry_count = attempt;
            let again = bal.balance(&mut r).unwrap();
            assert_eq!(again.subcluster, first_subcluster);
            assert!(!r.stat.cross_cluster);
            r.backend = Some(again);
        }

        // 次の試行でラウンドが進み、別サブクラスタへ
        r.retry_count = 3;
        let crossed = bal.balance(&mut r).unwrap();
        assert_ne!(crossed.subcluster, first_subcluster);
        assert!(r.stat.cross_cluster);
    }

    #[test]
    fn test_cross_retry_cap() {
        let bal = balancer(0, 1);
        let mut r = req();

        r.retry_count = 0;
        let b = bal.balance(&mut r).unwrap();
        r.backend = Some(b);

        r.retry_count = 1;
        let b = bal.balance(&mut r).unwrap();
        r.backend = Some(b);

        // (retry_max+1) * (cross_retry+1) = 2 を超える試行は拒否
        r.retry_count = 2;
        assert_eq!(
            bal.balance(&mut r).unwrap_err(),
            BalanceError::CrossRetryExceeded
        );
    }

    #[test]
    fn test_retry_avoids_failed_backend() {
        let bal = balancer(1, 0);
        let mut r = req();

        let first = bal.balance(&mut r).unwrap();
        r.backend = Some(Arc::clone(&first));
        r.retry_count = 1;

        let second = bal.balance(&mut r).unwrap();
        assert_eq!(second.subcluster, first.subcluster);
        if first.subcluster == "bj" {
            // bj には 2 台あるため必ず別の台になる
            assert_ne!(second.name, first.name);
        }
    }

    #[test]
    fn test_all_unhealthy_is_no_backend() {
        let bal = balancer(0, 0);
        for sc in &bal.subclusters {
            for b in &sc.backends {
                b.on_fail("c");
                b.on_fail("c");
                b.on_fail("c");
            }
        }
        let mut r = req();
        assert_eq!(bal.balance(&mut r).unwrap_err(), BalanceError::NoBackend);
    }

    #[test]
    fn test_session_sticky_same_key_same_backend() {
        let mut bal = balancer(0, 0);
        bal.session_sticky = true;
        bal.hash_strategy = HashStrategy::ClientIdPreferred;
        bal.hash_header = Some("Cookie:SESSIONID".into());

        let make = || {
            let mut r = req();
            r.headers = vec![crate::http2::hpack::HeaderField::new(
                b"cookie".as_slice(),
                b"SESSIONID=u-1001".as_slice(),
            )];
            r
        };

        let mut names = std::collections::HashSet::new();
        for _ in 0..8 {
            let mut r = make();
            let b = bal.balance(&mut r).unwrap();
            names.insert(format!("{}/{}", b.subcluster, b.name));
        }
        // 同一キーは同一サブクラスタ内で同一バックエンドに固定される…のは
        // サブクラスタ選択が WRR で回る分だけ台が変わり得るため、
        // サブクラスタごとに 1 台へ固定されることを確認する
        assert!(names.len() <= bal.subclusters.len());
    }

    #[test]
    fn test_client_id_header_extraction() {
        let mut bal = balancer(0, 0);
        bal.hash_strategy = HashStrategy::ClientIdOnly;
        bal.hash_header = Some("X-Device-Id".into());

        let mut r = req();
        r.headers = vec![crate::http2::hpack::HeaderField::new(
            b"x-device-id".as_slice(),
            b"dev-9".as_slice(),
        )];
        assert_eq!(bal.client_id(&r), Some(b"dev-9".to_vec()));

        bal.hash_header = Some("Cookie:UID".into());
        r.headers = vec![crate::http2::hpack::HeaderField::new(
            b"cookie".as_slice(),
            b"UID=u-7".as_slice(),
        )];
        assert_eq!(bal.client_id(&r), Some(b"u-7".to_vec()));
    }
}
