//! # サブクラスタ
//!
//! 障害ドメイン・地域単位のバックエンド集合。第 1 層 (サブクラスタ選択) の
//! 重み付きラウンドロビン状態と、第 2 層 (バックエンド選択) のラウンドロビン
//! カーソルを持ちます。カウンタはアトミックで、厳密な公平性より無ロックを
//! 優先します。

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::backend::Backend;

/// サブクラスタ
pub struct SubCluster {
    pub name: String,
    /// 第 1 層選択の重み
    pub weight: u32,
    pub backends: Vec<Arc<Backend>>,

    /// smooth WRR の現在重み
    wrr_current: AtomicI64,
    /// 第 2 層ラウンドロビンのカーソル
    rr_cursor: AtomicUsize,
}

impl SubCluster {
    pub fn new(name: impl Into<String>, weight: u32, backends: Vec<Arc<Backend>>) -> Self {
        Self {
            name: name.into(),
            weight: weight.max(1),
            backends,
            wrr_current: AtomicI64::new(0),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    /// 健全なバックエンドの一覧
    pub fn healthy_backends(&self) -> Vec<&Arc<Backend>> {
        self.backends.iter().filter(|b| b.is_healthy()).collect()
    }

    /// 健全なバックエンド数
    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_healthy()).count()
    }

    /// サブクラスタ内の現在接続数合計 (WLC 指標)
    pub fn total_conns(&self) -> i64 {
        self.backends.iter().map(|b| b.conn_num()).sum()
    }

    /// ラウンドロビンで健全なバックエンドを選ぶ
    ///
    /// `exclude` は直前に失敗したバックエンド。他に候補があれば避けます。
    pub fn pick_round_robin(&self, exclude: Option<&Arc<Backend>>) -> Option<Arc<Backend>> {
        let healthy = self.healthy_backends();
        if healthy.is_empty() {
            return None;
        }

        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..healthy.len() {
            let candidate = healthy[(start + i) % healthy.len()];
            if let Some(excluded) = exclude {
                if Arc::ptr_eq(candidate, excluded) && healthy.len() > 1 {
                    continue;
                }
            }
            return Some(Arc::clone(candidate));
        }
        None
    }

    /// ハッシュ値で健全なバックエンドを選ぶ (生存数の剰余)
    pub fn pick_hash_mod(&self, hash: u64, exclude: Option<&Arc<Backend>>) -> Option<Arc<Backend>> {
        let healthy = self.healthy_backends();
        if healthy.is_empty() {
            return None;
        }

        let at = (hash % healthy.len() as u64) as usize;
        for i in 0..healthy.len() {
            let candidate = healthy[(at + i) % healthy.len()];
            if let Some(excluded) = exclude {
                if Arc::ptr_eq(candidate, excluded) && healthy.len() > 1 {
                    continue;
                }
            }
            return Some(Arc::clone(candidate));
        }
        None
    }

    /// セッション維持: rendezvous ハッシュで決定的に選ぶ
    ///
    /// 同じキーは健全なバックエンド集合が変わらない限り同じ台に着地し、
    /// 台の増減時も移動が最小になります。
    pub fn pick_sticky(&self, key: &[u8], exclude: Option<&Arc<Backend>>) -> Option<Arc<Backend>> {
        let healthy = self.healthy_backends();
        if healthy.is_empty() {
            return None;
        }

        let mut ranked: Vec<(u64, &Arc<Backend>)> = healthy
            .iter()
            .map(|b| {
                let mut seed = Vec::with_capacity(key.len() + b.name.len() + 1);
                seed.extend_from_slice(key);
                seed.push(0);
                seed.extend_from_slice(b.name.as_bytes());
                (xxhash_rust::xxh3::xxh3_64(&seed), *b)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, candidate) in &ranked {
            if let Some(excluded) = exclude {
                if Arc::ptr_eq(candidate, excluded) && ranked.len() > 1 {
                    continue;
                }
            }
            return Some(Arc::clone(candidate));
        }
        None
    }

    /// smooth WRR の現在重みへ自重を加算して返す
    pub(crate) fn wrr_advance(&self) -> i64 {
        self.wrr_current
            .fetch_add(self.weight as i64, Ordering::Relaxed)
            + self.weight as i64
    }

    /// 選出されたサブクラスタから総重みを引く
    pub(crate) fn wrr_settle(&self, total_weight: i64) {
        self.wrr_current.fetch_sub(total_weight, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subcluster(n: usize) -> SubCluster {
        let backends = (0..n)
            .map(|i| {
                Arc::new(Backend::new(
                    format!("b{}", i),
                    format!("10.0.0.{}", i + 1),
                    8080,
                    "bj",
                    1,
                    3,
                    1,
                ))
            })
            .collect();
        SubCluster::new("bj", 1, backends)
    }

    #[test]
    fn test_round_robin_cycles() {
        let sc = subcluster(3);
        let picks: Vec<String> = (0..6)
            .map(|_| sc.pick_round_robin(None).unwrap().name.clone())
            .collect();
        // 3 台を一巡して繰り返す
        assert_eq!(picks[0..3], picks[3..6]);
        let mut names = picks[0..3].to_vec();
        names.sort();
        assert_eq!(names, ["b0", "b1", "b2"]);
    }

    #[test]
    fn test_unhealthy_skipped() {
        let sc = subcluster(3);
        sc.backends[1].on_fail("c");
        sc.backends[1].on_fail("c");
        sc.backends[1].on_fail("c");
        assert!(!sc.backends[1].is_healthy());

        for _ in 0..10 {
            let picked = sc.pick_round_robin(None).unwrap();
            assert_ne!(picked.name, "b1");
        }
        assert_eq!(sc.healthy_count(), 2);
    }

    #[test]
    fn test_exclude_failed_backend() {
        let sc = subcluster(2);
        let failed = Arc::clone(&sc.backends[0]);
        for _ in 0..5 {
            let picked = sc.pick_round_robin(Some(&failed)).unwrap();
            assert_eq!(picked.name, "b1");
        }
    }

    #[test]
    fn test_exclude_ignored_when_sole_survivor() {
        let sc = subcluster(1);
        let only = Arc::clone(&sc.backends[0]);
        assert!(sc.pick_round_robin(Some(&only)).is_some());
    }

    #[test]
    fn test_sticky_deterministic() {
        let sc = subcluster(4);
        let first = sc.pick_sticky(b"client-42", None).unwrap();
        for _ in 0..10 {
            let again = sc.pick_sticky(b"client-42", None).unwrap();
            assert_eq!(first.name, again.name);
        }
    }

    #[test]
    fn test_sticky_survives_unrelated_failure() {
        let sc = subcluster(4);
        let chosen = sc.pick_sticky(b"client-42", None).unwrap();

        // 選ばれていない台を落としても着地先は変わらない
        for b in &sc.backends {
            if !Arc::ptr_eq(b, &chosen) {
                b.on_fail("c");
                b.on_fail("c");
                b.on_fail("c");
                break;
            }
        }
        let again = sc.pick_sticky(b"client-42", None).unwrap();
        assert_eq!(chosen.name, again.name);
    }

    #[test]
    fn test_hash_mod_stable_for_same_key() {
        let sc = subcluster(3);
        let h = xxhash_rust::xxh3::xxh3_64(b"1.2.3.4");
        let a = sc.pick_hash_mod(h, None).unwrap();
        let b = sc.pick_hash_mod(h, None).unwrap();
        assert_eq!(a.name, b.name);
    }
}
