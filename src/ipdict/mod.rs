//! # IP 辞書
//!
//! 単独 IP とレンジ IP の高速メンバーシップ判定を提供します。
//! 単独 IP はハッシュセット、レンジは開始アドレス降順のソート済み配列で保持し、
//! `contains()` はハッシュヒットまたはレンジヒットで判定します。
//!
//! IPv4 は IPv4-mapped IPv6 (`::ffff:a.b.c.d`) の 16 バイト正規形に変換して
//! 比較します。

use std::collections::HashSet;
use std::hash::BuildHasherDefault;
use std::net::IpAddr;

use xxhash_rust::xxh3::Xxh3;

/// 正規化済み IP (16 バイト固定)
pub type Ip16 = [u8; 16];

type IpHasher = BuildHasherDefault<Xxh3>;

/// IP アドレスを 16 バイト正規形に変換
///
/// IPv4 は `::ffff:a.b.c.d` にマップします。
pub fn canonical_ip(ip: IpAddr) -> Ip16 {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// レンジエントリ
///
/// マージで吸収されたエントリは `dead` を立てて finalize() 時に除去します。
/// 0.0.0.0 も正当な境界値として扱えるよう、ゼロ IP を番兵に使いません。
#[derive(Debug, Clone, Copy)]
struct IpRange {
    start: Ip16,
    end: Ip16,
    dead: bool,
}

/// IP 辞書
pub struct IpItems {
    /// 単独 IP 集合
    singles: HashSet<Ip16, IpHasher>,
    /// レンジ配列 (finalize 後は start 降順・マージ済み)
    ranges: Vec<IpRange>,
    /// 設定バージョン
    pub version: String,
}

impl IpItems {
    /// 空の辞書を作成
    pub fn new() -> Self {
        Self {
            singles: HashSet::default(),
            ranges: Vec::new(),
            version: String::new(),
        }
    }

    /// 単独 IP を追加
    pub fn insert_singleton(&mut self, ip: IpAddr) {
        self.singles.insert(canonical_ip(ip));
    }

    /// レンジを追加
    ///
    /// start > end のレンジは無効として拒否します。
    pub fn insert_range(&mut self, start: IpAddr, end: IpAddr) -> Result<(), String> {
        let start = canonical_ip(start);
        let end = canonical_ip(end);
        if start > end {
            return Err(format!(
                "invalid ip range: start {:x?} > end {:x?}",
                start, end
            ));
        }
        self.ranges.push(IpRange {
            start,
            end,
            dead: false,
        });
        Ok(())
    }

    /// レンジ配列を正規化
    ///
    /// 1. start 降順にソート
    /// 2. 重複・隣接レンジをマージ (吸収側に dead を立てる)
    /// 3. dead エントリを除去
    ///
    /// finalize(finalize(S)) == finalize(S) が成り立ちます。
    pub fn finalize(&mut self) {
        self.ranges.sort_by(|a, b| b.start.cmp(&a.start));

        // 降順なので後方 (j) のエントリほど start が小さい。
        // succ(items[j].end) >= items[i].start なら重複または隣接で結合できる。
        // 結合時は i..j の間の生存エントリも吸収する (それらは end < items[i].start
        // を満たすため、結合後のレンジに完全に含まれる)。
        let len = self.ranges.len();
        for i in 0..len {
            if self.ranges[i].dead {
                continue;
            }
            for j in (i + 1)..len {
                if self.ranges[j].dead {
                    continue;
                }
                let reach = ip16_succ(self.ranges[j].end);
                if reach >= self.ranges[i].start {
                    // j のレンジが i のレンジに届く: i に吸収
                    self.ranges[i].start = self.ranges[j].start;
                    if self.ranges[j].end > self.ranges[i].end {
                        self.ranges[i].end = self.ranges[j].end;
                    }
                    self.ranges[j].dead = true;

                    for k in (i + 1)..j {
                        self.ranges[k].dead = true;
                    }
                }
            }
        }

        self.ranges.retain(|r| !r.dead);
        self.ranges.sort_by(|a, b| b.start.cmp(&a.start));
    }

    /// メンバーシップ判定
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip16 = canonical_ip(ip);

        if self.singles.contains(&ip16) {
            return true;
        }

        // start 降順: start <= ip を満たす最初のエントリで判定が決まる
        for r in &self.ranges {
            if r.start <= ip16 {
                return ip16 <= r.end;
            }
        }

        false
    }

    /// レンジ数
    pub fn range_len(&self) -> usize {
        self.ranges.len()
    }

    /// 登録 IP 数 (単独 + レンジ)
    pub fn len(&self) -> usize {
        self.singles.len() + self.ranges.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.singles.is_empty() && self.ranges.is_empty()
    }
}

impl Default for IpItems {
    fn default() -> Self {
        Self::new()
    }
}

/// 16 バイト IP の後続値 (飽和)
///
/// 隣接レンジ ([a, b] と [b+1, c]) のマージ判定に使用します。
fn ip16_succ(ip: Ip16) -> Ip16 {
    let mut out = ip;
    for b in out.iter_mut().rev() {
        if *b == 0xFF {
            *b = 0;
        } else {
            *b += 1;
            return out;
        }
    }
    // 全ビット 1 はオーバーフローするので元の値を返す
    ip
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_singleton_contains() {
        let mut items = IpItems::new();
        items.insert_singleton(v4("10.0.0.1"));
        items.finalize();

        assert!(items.contains(v4("10.0.0.1")));
        assert!(!items.contains(v4("10.0.0.2")));
    }

    #[test]
    fn test_v4_v6_canonical() {
        let mut items = IpItems::new();
        items.insert_singleton(v4("192.168.0.1"));
        items.finalize();

        // IPv4-mapped IPv6 でも同一視される
        assert!(items.contains("::ffff:192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn test_range_merge_overlap() {
        let mut items = IpItems::new();
        items.insert_singleton(v4("10.0.0.1"));
        items
            .insert_range(v4("10.0.0.5"), v4("10.0.0.20"))
            .unwrap();
        items
            .insert_range(v4("10.0.0.15"), v4("10.0.0.30"))
            .unwrap();
        items.finalize();

        // 重複レンジは 1 本にマージされる
        assert_eq!(items.range_len(), 1);
        assert!(items.contains(v4("10.0.0.25")));
        assert!(items.contains(v4("10.0.0.5")));
        assert!(items.contains(v4("10.0.0.30")));
        assert!(!items.contains(v4("10.0.0.3")));
        assert!(!items.contains(v4("10.0.0.31")));
    }

    #[test]
    fn test_range_merge_adjacent() {
        let mut items = IpItems::new();
        items
            .insert_range(v4("10.0.0.1"), v4("10.0.0.10"))
            .unwrap();
        items
            .insert_range(v4("10.0.0.11"), v4("10.0.0.20"))
            .unwrap();
        items.finalize();

        assert_eq!(items.range_len(), 1);
        assert!(items.contains(v4("10.0.0.15")));
    }

    #[test]
    fn test_disjoint_ranges_not_merged() {
        let mut items = IpItems::new();
        items
            .insert_range(v4("10.0.0.1"), v4("10.0.0.10"))
            .unwrap();
        items
            .insert_range(v4("10.0.1.1"), v4("10.0.1.10"))
            .unwrap();
        items.finalize();

        assert_eq!(items.range_len(), 2);
        assert!(items.contains(v4("10.0.0.5")));
        assert!(items.contains(v4("10.0.1.5")));
        assert!(!items.contains(v4("10.0.0.200")));
    }

    #[test]
    fn test_finalize_idempotent() {
        let mut items = IpItems::new();
        items
            .insert_range(v4("10.26.74.55"), v4("10.26.74.255"))
            .unwrap();
        items
            .insert_range(v4("10.12.14.2"), v4("10.12.14.50"))
            .unwrap();
        items
            .insert_range(v4("10.21.34.5"), v4("10.23.77.100"))
            .unwrap();
        items
            .insert_range(v4("10.23.77.88"), v4("10.23.77.240"))
            .unwrap();

        items.finalize();
        let first: Vec<_> = items.ranges.iter().map(|r| (r.start, r.end)).collect();

        items.finalize();
        let second: Vec<_> = items.ranges.iter().map(|r| (r.start, r.end)).collect();

        assert_eq!(first, second);
        assert_eq!(items.range_len(), 3);
    }

    #[test]
    fn test_bridging_range_absorbs_intermediates() {
        // [5..150] が [100..200] に届くとき、間に挟まる [10..20] も吸収される
        let mut items = IpItems::new();
        items
            .insert_range(v4("10.0.0.100"), v4("10.0.0.200"))
            .unwrap();
        items
            .insert_range(v4("10.0.0.10"), v4("10.0.0.20"))
            .unwrap();
        items
            .insert_range(v4("10.0.0.5"), v4("10.0.0.150"))
            .unwrap();
        items.finalize();

        assert_eq!(items.range_len(), 1);
        assert!(items.contains(v4("10.0.0.50")));
        assert!(items.contains(v4("10.0.0.5")));
        assert!(items.contains(v4("10.0.0.200")));
    }

    #[test]
    fn test_zero_ip_is_valid_bound() {
        // 0.0.0.0 を境界に持つレンジが番兵と混同されないこと
        let mut items = IpItems::new();
        items.insert_range(v4("0.0.0.0"), v4("0.0.0.10")).unwrap();
        items.finalize();

        assert_eq!(items.range_len(), 1);
        assert!(items.contains(v4("0.0.0.5")));
    }

    #[test]
    fn test_invalid_range_rejected() {
        let mut items = IpItems::new();
        assert!(items
            .insert_range(v4("10.0.0.20"), v4("10.0.0.5"))
            .is_err());
    }
}
