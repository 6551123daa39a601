//! # HPACK エンコーダ (RFC 7541)

use super::huffman;
use super::table::{DynamicTable, StaticTable};
use super::{encode_integer, HpackResult};

/// HPACK エンコーダ
///
/// 完全一致はインデックス参照、それ以外はインクリメンタルインデックス付き
/// リテラルで送出します。sensitive 指定されたフィールドは Never Indexed に
/// して中間者のテーブル探索攻撃から守ります。
pub struct HpackEncoder {
    dynamic: DynamicTable,
    use_huffman: bool,
    /// ピアの SETTINGS 変更で保留中のテーブルサイズ更新
    pending_size_update: Option<usize>,
}

impl HpackEncoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            dynamic: DynamicTable::new(max_table_size),
            use_huffman: true,
            pending_size_update: None,
        }
    }

    pub fn set_huffman(&mut self, enabled: bool) {
        self.use_huffman = enabled;
    }

    /// ピアの SETTINGS_HEADER_TABLE_SIZE 変更を反映する
    ///
    /// 更新命令は次のヘッダーブロックの先頭で送出されます (RFC 7541 Section 4.2)。
    pub fn set_max_table_size(&mut self, size: usize) {
        self.pending_size_update = Some(size);
        self.dynamic.set_max_size(size);
    }

    /// ヘッダーリストをエンコードする
    ///
    /// 各要素は (名前, 値, sensitive)。
    pub fn encode(&mut self, headers: &[(&[u8], &[u8], bool)]) -> HpackResult<Vec<u8>> {
        let mut out = Vec::with_capacity(headers.len() * 32);

        if let Some(size) = self.pending_size_update.take() {
            encode_integer(&mut out, size, 5, 0x20);
        }

        for &(name, value, sensitive) in headers {
            if sensitive {
                self.write_never_indexed(&mut out, name, value);
            } else {
                self.write_field(&mut out, name, value);
            }
        }

        Ok(out)
    }

    fn write_field(&mut self, out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
        // 完全一致はインデックス 1 本で済む (Section 6.1)
        if let Some(index) = self.find_field(name, value) {
            encode_integer(out, index, 7, 0x80);
            return;
        }

        // 名前一致 + リテラル値、インクリメンタルインデックス (Section 6.2.1)
        match self.find_name(name) {
            Some(index) => encode_integer(out, index, 6, 0x40),
            None => {
                out.push(0x40);
                self.write_string(out, name);
            }
        }
        self.write_string(out, value);

        self.dynamic.insert(name.to_vec(), value.to_vec());
    }

    /// Never Indexed リテラル (Section 6.2.3)
    fn write_never_indexed(&self, out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
        match self.find_name(name) {
            Some(index) => encode_integer(out, index, 4, 0x10),
            None => {
                out.push(0x10);
                self.write_string(out, name);
            }
        }
        self.write_string(out, value);
    }

    fn find_field(&self, name: &[u8], value: &[u8]) -> Option<usize> {
        StaticTable::match_field(name, value)
            .or_else(|| self.dynamic.match_field(name, value).map(|i| i + StaticTable::LEN))
    }

    fn find_name(&self, name: &[u8]) -> Option<usize> {
        StaticTable::match_name(name)
            .or_else(|| self.dynamic.match_name(name).map(|i| i + StaticTable::LEN))
    }

    /// 文字列リテラル (Section 5.2)。Huffman 符号が短くなる場合のみ使う。
    fn write_string(&self, out: &mut Vec<u8>, s: &[u8]) {
        if self.use_huffman {
            let coded_len = huffman::encoded_len(s);
            if coded_len < s.len() {
                encode_integer(out, coded_len, 7, 0x80);
                out.extend(huffman::encode(s));
                return;
            }
        }
        encode_integer(out, s.len(), 7, 0x00);
        out.extend_from_slice(s);
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new(4096)
    }
}
