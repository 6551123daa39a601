//! # HPACK デコーダ (RFC 7541)
//!
//! 再組立て済みのヘッダーブロックを受け取り、フィールド列を返します。
//! ブロック末尾で命令が不完全な場合はエラーで、コネクションは
//! COMPRESSION_ERROR で閉じられます。

use super::huffman;
use super::table::{lookup, DynamicTable, HeaderField};
use super::{decode_integer, HpackError, HpackResult};

/// HPACK デコーダ
pub struct HpackDecoder {
    dynamic: DynamicTable,
    /// SETTINGS_HEADER_TABLE_SIZE で広告した上限。
    /// ピアのテーブルサイズ更新はこの値を超えられない。
    max_table_size: usize,
    /// デコード結果のヘッダーリストサイズ上限
    max_header_list_size: usize,
}

impl HpackDecoder {
    pub fn new(max_table_size: usize, max_header_list_size: usize) -> Self {
        Self {
            dynamic: DynamicTable::new(max_table_size),
            max_table_size,
            max_header_list_size,
        }
    }

    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.dynamic
    }

    /// ヘッダーブロックをデコードする
    pub fn decode(&mut self, block: &[u8]) -> HpackResult<Vec<HeaderField>> {
        let mut fields = Vec::new();
        let mut pos = 0;
        let mut list_size = 0usize;

        while pos < block.len() {
            let rest = &block[pos..];
            let first = rest[0];

            let field = if first & 0x80 != 0 {
                // Indexed Header Field (Section 6.1)
                let (index, used) = decode_integer(rest, 7)?;
                pos += used;
                if index == 0 {
                    return Err(HpackError::BadIndex(0));
                }
                let (name, value) =
                    lookup(&self.dynamic, index).ok_or(HpackError::BadIndex(index))?;
                HeaderField::new(name, value)
            } else if first & 0x40 != 0 {
                // Literal with Incremental Indexing (Section 6.2.1)
                let (field, used) = self.decode_literal(rest, 6)?;
                pos += used;
                self.dynamic.insert(field.name.clone(), field.value.clone());
                field
            } else if first & 0x20 != 0 {
                // Dynamic Table Size Update (Section 6.3)
                let (size, used) = decode_integer(rest, 5)?;
                pos += used;
                if size > self.max_table_size {
                    return Err(HpackError::TableSizeUpdate(size, self.max_table_size));
                }
                self.dynamic.set_max_size(size);
                continue;
            } else {
                // Literal without Indexing / Never Indexed (Section 6.2.2, 6.2.3)
                let (field, used) = self.decode_literal(rest, 4)?;
                pos += used;
                field
            };

            list_size = list_size.saturating_add(field.size());
            if list_size > self.max_header_list_size {
                return Err(HpackError::HeaderListTooLarge(list_size));
            }
            fields.push(field);
        }

        Ok(fields)
    }

    /// リテラルフィールドをデコードする (名前はインデックス参照またはリテラル)
    fn decode_literal(&self, buf: &[u8], prefix_bits: u8) -> HpackResult<(HeaderField, usize)> {
        let (index, mut used) = decode_integer(buf, prefix_bits)?;

        let name = if index > 0 {
            let (name, _) = lookup(&self.dynamic, index).ok_or(HpackError::BadIndex(index))?;
            name.to_vec()
        } else {
            let (name, n) = decode_string(&buf[used..])?;
            used += n;
            name
        };

        let (value, n) = decode_string(&buf[used..])?;
        used += n;

        Ok((HeaderField { name, value }, used))
    }
}

/// 文字列リテラルをデコードする (RFC 7541 Section 5.2)
fn decode_string(buf: &[u8]) -> HpackResult<(Vec<u8>, usize)> {
    let Some(&first) = buf.first() else {
        return Err(HpackError::Truncated);
    };
    let huffman_coded = first & 0x80 != 0;

    let (len, used) = decode_integer(buf, 7)?;
    let end = used.checked_add(len).ok_or(HpackError::IntegerOverflow)?;
    if end > buf.len() {
        return Err(HpackError::Truncated);
    }

    let raw = &buf[used..end];
    let decoded = if huffman_coded {
        huffman::decode(raw)?
    } else {
        raw.to_vec()
    };
    Ok((decoded, end))
}

#[cfg(test)]
mod tests {
    use super::super::encoder::HpackEncoder;
    use super::*;

    fn decoder() -> HpackDecoder {
        HpackDecoder::new(4096, 65536)
    }

    #[test]
    fn test_indexed_static() {
        // :method GET は静的テーブル index 2
        let fields = decoder().decode(&[0x82]).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, b":method");
        assert_eq!(fields[0].value, b"GET");
    }

    #[test]
    fn test_rfc_c3_requests_without_huffman() {
        // RFC 7541 C.3.1: 最初のリクエスト
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x0f, 0x77, 0x77, 0x77, 0x2e, 0x65, 0x78, 0x61, 0x6d,
            0x70, 0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d,
        ];
        let mut dec = decoder();
        let fields = dec.decode(&block).unwrap();

        let expect: &[(&[u8], &[u8])] = &[
            (b":method", b"GET"),
            (b":scheme", b"http"),
            (b":path", b"/"),
            (b":authority", b"www.example.com"),
        ];
        assert_eq!(fields.len(), expect.len());
        for (field, &(n, v)) in fields.iter().zip(expect) {
            assert_eq!(field.name, n);
            assert_eq!(field.value, v);
        }
        // :authority www.example.com が動的テーブルに積まれている
        assert_eq!(dec.dynamic_table().len(), 1);
    }

    #[test]
    fn test_dynamic_table_reference_across_blocks() {
        let mut enc = HpackEncoder::new(4096);
        let mut dec = decoder();

        let list: Vec<(&[u8], &[u8], bool)> =
            vec![(b"x-trace-id", b"abc", false)];
        let block1 = enc.encode(&list).unwrap();
        dec.decode(&block1).unwrap();

        // 2 ブロック目は動的テーブル参照になる
        let block2 = enc.encode(&list).unwrap();
        assert!(block2.len() < block1.len());
        let fields = dec.decode(&block2).unwrap();
        assert_eq!(fields[0].name, b"x-trace-id");
        assert_eq!(fields[0].value, b"abc");
    }

    #[test]
    fn test_bad_index_rejected() {
        // 動的テーブルが空の状態で index 62 を参照
        let err = decoder().decode(&[0x80 | 62]).unwrap_err();
        assert_eq!(err, HpackError::BadIndex(62));
    }

    #[test]
    fn test_truncated_block_rejected() {
        // リテラル名の途中で切れている
        let block = [0x40, 0x05, b'a', b'b'];
        assert_eq!(decoder().decode(&block), Err(HpackError::Truncated));
    }

    #[test]
    fn test_table_size_update_over_limit() {
        let mut out = vec![];
        super::super::encode_integer(&mut out, 8192, 5, 0x20);
        let err = decoder().decode(&out).unwrap_err();
        assert_eq!(err, HpackError::TableSizeUpdate(8192, 4096));
    }

    #[test]
    fn test_header_list_size_limit() {
        let mut dec = HpackDecoder::new(4096, 64);
        let mut enc = HpackEncoder::new(4096);
        let list: Vec<(&[u8], &[u8], bool)> = vec![
            (b"x-a", b"aaaaaaaaaaaaaaaa", false),
            (b"x-b", b"bbbbbbbbbbbbbbbb", false),
        ];
        let block = enc.encode(&list).unwrap();
        assert!(matches!(
            dec.decode(&block),
            Err(HpackError::HeaderListTooLarge(_))
        ));
    }

    #[test]
    fn test_roundtrip_with_huffman() {
        let mut enc = HpackEncoder::new(4096);
        let mut dec = decoder();

        let list: Vec<(&[u8], &[u8], bool)> = vec![
            (b":method", b"POST", false),
            (b":path", b"/api/v1/items?q=abc", false),
            (b"user-agent", b"Mozilla/5.0 (X11; Linux x86_64)", false),
            (b"cookie", b"session=deadbeef", true),
        ];
        let block = enc.encode(&list).unwrap();
        let fields = dec.decode(&block).unwrap();

        assert_eq!(fields.len(), list.len());
        for (field, (n, v, _)) in fields.iter().zip(&list) {
            assert_eq!(&field.name, n);
            assert_eq!(&field.value, v);
        }
    }
}
