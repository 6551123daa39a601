//! # HPACK インデックステーブル (RFC 7541 Section 2)
//!
//! 61 エントリの静的テーブル (Appendix A) と FIFO 動的テーブル。
//! 統合アドレス空間ではインデックス 1..=61 が静的、62.. が動的テーブルです。

use std::collections::VecDeque;

/// ヘッダーフィールド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// エントリサイズ = name + value + 32 (RFC 7541 Section 4.1)
    #[inline]
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }

    /// 擬似ヘッダーかどうか
    #[inline]
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }
}

/// 静的テーブル (RFC 7541 Appendix A)
pub struct StaticTable;

impl StaticTable {
    pub const LEN: usize = 61;

    const ENTRIES: [(&'static [u8], &'static [u8]); 61] = [
        (b":authority", b""),
        (b":method", b"GET"),
        (b":method", b"POST"),
        (b":path", b"/"),
        (b":path", b"/index.html"),
        (b":scheme", b"http"),
        (b":scheme", b"https"),
        (b":status", b"200"),
        (b":status", b"204"),
        (b":status", b"206"),
        (b":status", b"304"),
        (b":status", b"400"),
        (b":status", b"404"),
        (b":status", b"500"),
        (b"accept-charset", b""),
        (b"accept-encoding", b"gzip, deflate"),
        (b"accept-language", b""),
        (b"accept-ranges", b""),
        (b"accept", b""),
        (b"access-control-allow-origin", b""),
        (b"age", b""),
        (b"allow", b""),
        (b"authorization", b""),
        (b"cache-control", b""),
        (b"content-disposition", b""),
        (b"content-encoding", b""),
        (b"content-language", b""),
        (b"content-length", b""),
        (b"content-location", b""),
        (b"content-range", b""),
        (b"content-type", b""),
        (b"cookie", b""),
        (b"date", b""),
        (b"etag", b""),
        (b"expect", b""),
        (b"expires", b""),
        (b"from", b""),
        (b"host", b""),
        (b"if-match", b""),
        (b"if-modified-since", b""),
        (b"if-none-match", b""),
        (b"if-range", b""),
        (b"if-unmodified-since", b""),
        (b"last-modified", b""),
        (b"link", b""),
        (b"location", b""),
        (b"max-forwards", b""),
        (b"proxy-authenticate", b""),
        (b"proxy-authorization", b""),
        (b"range", b""),
        (b"referer", b""),
        (b"refresh", b""),
        (b"retry-after", b""),
        (b"server", b""),
        (b"set-cookie", b""),
        (b"strict-transport-security", b""),
        (b"transfer-encoding", b""),
        (b"user-agent", b""),
        (b"vary", b""),
        (b"via", b""),
        (b"www-authenticate", b""),
    ];

    /// 1 始まりインデックスでエントリを取得
    #[inline]
    pub fn entry(index: usize) -> Option<(&'static [u8], &'static [u8])> {
        if index == 0 || index > Self::LEN {
            return None;
        }
        Some(Self::ENTRIES[index - 1])
    }

    /// 名前と値が完全一致するインデックスを検索
    pub fn match_field(name: &[u8], value: &[u8]) -> Option<usize> {
        Self::ENTRIES
            .iter()
            .position(|&(n, v)| n == name && v == value)
            .map(|i| i + 1)
    }

    /// 名前が一致する最初のインデックスを検索
    pub fn match_name(name: &[u8]) -> Option<usize> {
        Self::ENTRIES
            .iter()
            .position(|&(n, _)| n == name)
            .map(|i| i + 1)
    }
}

/// 動的テーブル (RFC 7541 Section 2.3.2)
///
/// 新しいエントリが先頭 (インデックス 1)。挿入・サイズ変更時に末尾から追い出します。
pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// 最大サイズを変更し、超過分を追い出す (RFC 7541 Section 4.3)
    ///
    /// 追い出しは次のフィールド処理より前に適用されます。
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to_fit(0);
    }

    /// エントリを追加 (RFC 7541 Section 4.4)
    pub fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let entry = HeaderField { name, value };
        let entry_size = entry.size();

        if entry_size > self.max_size {
            // テーブル容量を超えるエントリは全エントリを追い出すのと等価
            self.entries.clear();
            self.size = 0;
            return;
        }

        self.evict_to_fit(entry_size);
        self.size += entry_size;
        self.entries.push_front(entry);
    }

    /// 1 始まりの動的テーブル内インデックスで取得
    #[inline]
    pub fn entry(&self, index: usize) -> Option<&HeaderField> {
        index.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// 名前と値が完全一致するインデックスを検索
    pub fn match_field(&self, name: &[u8], value: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name && e.value == value)
            .map(|i| i + 1)
    }

    /// 名前が一致する最初のインデックスを検索
    pub fn match_name(&self, name: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| i + 1)
    }

    fn evict_to_fit(&mut self, incoming: usize) {
        while self.size + incoming > self.max_size {
            match self.entries.pop_back() {
                Some(old) => self.size -= old.size(),
                None => break,
            }
        }
    }
}

/// 統合インデックス空間の参照 (1..=61 静的、62.. 動的)
pub fn lookup<'a>(
    dynamic: &'a DynamicTable,
    index: usize,
) -> Option<(&'a [u8], &'a [u8])> {
    if index == 0 {
        return None;
    }
    if index <= StaticTable::LEN {
        StaticTable::entry(index)
    } else {
        dynamic
            .entry(index - StaticTable::LEN)
            .map(|e| (e.name.as_slice(), e.value.as_slice()))
    }
}
