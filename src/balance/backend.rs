//! # バックエンドインスタンス
//!
//! 接続数・連続成功/失敗カウンタ・健全性フラグを持つ転送先。複数スレッドの
//! パイプラインから同時に更新されるため、すべてアトミックで保持します。
//! 健全性の遷移は連続カウンタがしきい値へ達したときのみ起こります。

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

/// バックエンド 1 台
#[derive(Debug)]
pub struct Backend {
    /// 一意な名前 (設定由来)
    pub name: String,
    pub addr: String,
    pub port: u16,
    /// 所属サブクラスタ
    pub subcluster: String,
    /// WRR 用の重み
    pub weight: u32,

    /// 現在の接続数 (WLC の指標)
    conn_num: AtomicI64,
    /// 連続失敗数
    fail_num: AtomicU32,
    /// 連続成功数 (ヘルスチェック用)
    succ_num: AtomicU32,
    healthy: AtomicBool,

    /// 不健全と判定する連続失敗しきい値
    fail_threshold: u32,
    /// 健全へ戻す連続成功しきい値
    succ_threshold: u32,
}

impl Backend {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        port: u16,
        subcluster: impl Into<String>,
        weight: u32,
        fail_threshold: u32,
        succ_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            port,
            subcluster: subcluster.into(),
            weight: weight.max(1),
            conn_num: AtomicI64::new(0),
            fail_num: AtomicU32::new(0),
            succ_num: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            fail_threshold: fail_threshold.max(1),
            succ_threshold: succ_threshold.max(1),
        }
    }

    /// "addr:port" 形式の接続先
    pub fn addr_info(&self) -> String {
        let mut buf = itoa::Buffer::new();
        let mut s = String::with_capacity(self.addr.len() + 6);
        s.push_str(&self.addr);
        s.push(':');
        s.push_str(buf.format(self.port));
        s
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn conn_num(&self) -> i64 {
        self.conn_num.load(Ordering::Relaxed)
    }

    pub fn inc_conn(&self) {
        self.conn_num.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.conn_num.fetch_sub(1, Ordering::Relaxed);
    }

    /// 転送成功: 失敗カウンタをリセット
    pub fn on_success(&self) {
        self.fail_num.store(0, Ordering::Relaxed);
    }

    /// 転送失敗: 連続失敗がしきい値に達したら不健全へ
    pub fn on_fail(&self, cluster: &str) {
        let fails = self.fail_num.fetch_add(1, Ordering::Relaxed) + 1;
        self.succ_num.store(0, Ordering::Relaxed);
        if fails >= self.fail_threshold && self.healthy.swap(false, Ordering::Relaxed) {
            ftlog::warn!(
                "[balance] backend {} ({}) of cluster {} marked unhealthy after {} failures",
                self.name,
                self.addr_info(),
                cluster,
                fails
            );
        }
    }

    /// 外部ヘルスチェッカーからの成功通知
    ///
    /// 連続成功がしきい値に達したら健全へ戻します。
    pub fn on_check_success(&self) {
        let succ = self.succ_num.fetch_add(1, Ordering::Relaxed) + 1;
        if succ >= self.succ_threshold && !self.healthy.swap(true, Ordering::Relaxed) {
            self.fail_num.store(0, Ordering::Relaxed);
            ftlog::info!(
                "[balance] backend {} ({}) back to healthy",
                self.name,
                self.addr_info()
            );
        }
    }

    /// 外部ヘルスチェッカーからの失敗通知
    pub fn on_check_fail(&self) {
        self.succ_num.store(0, Ordering::Relaxed);
        let fails = self.fail_num.fetch_add(1, Ordering::Relaxed) + 1;
        if fails >= self.fail_threshold {
            self.healthy.store(false, Ordering::Relaxed);
        }
    }
}
