//! # 逆順 FQDN トライ
//!
//! ホスト名をドット区切りラベルの逆順 (`www.example.com` →
//! `["com", "example", "www"]`) でキーにします。多くのホスト名は TLD と
//! 組織名サフィックスを共有するため、逆順にするとトライが小さくなります。
//!
//! ノードの子はハッシュマップではなく (ラベル, 子インデックス) のソート済み
//! 配列で持ち、二分探索で引きます。ワイルドカードラベル `*` は探索中の
//! 各深さでフォールバック終端として記録されます。

/// ワイルドカードラベル
const WILDCARD: &str = "*";

struct TrieNode {
    /// ラベルでソートされた (ラベル, 子ノード番号)
    children: Vec<(Box<str>, u32)>,
    /// `*` の子ノード番号
    wildcard: Option<u32>,
    /// このノードを終端とする値
    value: Option<u32>,
}

impl TrieNode {
    fn new() -> Self {
        Self {
            children: Vec::new(),
            wildcard: None,
            value: None,
        }
    }

    fn child(&self, label: &str) -> Option<u32> {
        self.children
            .binary_search_by(|(l, _)| l.as_ref().cmp(label))
            .ok()
            .map(|i| self.children[i].1)
    }
}

/// 逆順ラベルトライ
pub struct Trie<T> {
    nodes: Vec<TrieNode>,
    values: Vec<T>,
}

impl<T> Trie<T> {
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new()],
            values: Vec::new(),
        }
    }

    /// 逆順ラベル列に値を登録する。既存キーは上書き。
    pub fn insert(&mut self, labels: &[&str], value: T) {
        let mut node = 0usize;
        for &label in labels {
            let next = if label == WILDCARD {
                match self.nodes[node].wildcard {
                    Some(n) => n,
                    None => {
                        let n = self.push_node();
                        self.nodes[node].wildcard = Some(n);
                        n
                    }
                }
            } else {
                match self.nodes[node].child(label) {
                    Some(n) => n,
                    None => {
                        let n = self.push_node();
                        let children = &mut self.nodes[node].children;
                        let at = children
                            .binary_search_by(|(l, _)| l.as_ref().cmp(label))
                            .unwrap_err();
                        children.insert(at, (label.into(), n));
                        n
                    }
                }
            };
            node = next as usize;
        }

        match self.nodes[node].value {
            Some(i) => self.values[i as usize] = value,
            None => {
                self.values.push(value);
                self.nodes[node].value = Some(self.values.len() as u32 - 1);
            }
        }
    }

    /// 逆順ラベル列で検索する
    ///
    /// 完全一致を優先し、無ければ探索中に見た最も深いワイルドカード終端を
    /// 返します。
    pub fn get(&self, labels: &[&str]) -> Option<&T> {
        let mut node = 0usize;
        let mut wildcard_hit: Option<u32> = None;

        for &label in labels {
            // この深さのワイルドカード終端を控えておく
            if let Some(w) = self.nodes[node].wildcard {
                if let Some(v) = self.nodes[w as usize].value {
                    wildcard_hit = Some(v);
                }
            }

            match self.nodes[node].child(label) {
                Some(next) => node = next as usize,
                None => {
                    return wildcard_hit.map(|i| &self.values[i as usize]);
                }
            }
        }

        match self.nodes[node].value {
            Some(i) => Some(&self.values[i as usize]),
            None => {
                // 末尾がちょうどワイルドカード位置の場合 ("a.b" vs "*.a.b")
                if let Some(w) = self.nodes[node].wildcard {
                    if let Some(v) = self.nodes[w as usize].value {
                        return Some(&self.values[v as usize]);
                    }
                }
                wildcard_hit.map(|i| &self.values[i as usize])
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn push_node(&mut self) -> u32 {
        self.nodes.push(TrieNode::new());
        self.nodes.len() as u32 - 1
    }
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// ホスト名を逆順ラベル列に分解する (入力は正規化済みであること)
pub fn reverse_labels(host: &str) -> Vec<&str> {
    host.split('.').rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> Trie<&'static str> {
        let mut trie = Trie::new();
        trie.insert(&reverse_labels("news.example.com"), "news");
        trie.insert(&reverse_labels("www.example.com"), "www");
        trie.insert(&reverse_labels("*.static.example.com"), "static-wild");
        trie.insert(&reverse_labels("example.org"), "org");
        trie
    }

    #[test]
    fn test_reverse_labels() {
        assert_eq!(reverse_labels("www.example.com"), ["com", "example", "www"]);
        assert_eq!(reverse_labels("localhost"), ["localhost"]);
    }

    #[test]
    fn test_exact_match() {
        let trie = build();
        assert_eq!(
            trie.get(&reverse_labels("news.example.com")),
            Some(&"news")
        );
        assert_eq!(trie.get(&reverse_labels("www.example.com")), Some(&"www"));
        assert_eq!(trie.get(&reverse_labels("example.org")), Some(&"org"));
    }

    #[test]
    fn test_miss() {
        let trie = build();
        assert_eq!(trie.get(&reverse_labels("api.example.com")), None);
        assert_eq!(trie.get(&reverse_labels("example.com")), None);
        assert_eq!(trie.get(&reverse_labels("news.example.net")), None);
    }

    #[test]
    fn test_wildcard_match() {
        let trie = build();
        assert_eq!(
            trie.get(&reverse_labels("img.static.example.com")),
            Some(&"static-wild")
        );
        // ワイルドカードは 1 ラベル超でも最深フォールバックとして効く
        assert_eq!(
            trie.get(&reverse_labels("a.b.static.example.com")),
            Some(&"static-wild")
        );
    }

    #[test]
    fn test_exact_wins_over_wildcard() {
        let mut trie = build();
        trie.insert(&reverse_labels("img.static.example.com"), "img-exact");
        assert_eq!(
            trie.get(&reverse_labels("img.static.example.com")),
            Some(&"img-exact")
        );
        assert_eq!(
            trie.get(&reverse_labels("other.static.example.com")),
            Some(&"static-wild")
        );
    }

    #[test]
    fn test_overwrite() {
        let mut trie = build();
        trie.insert(&reverse_labels("news.example.com"), "news2");
        assert_eq!(trie.get(&reverse_labels("news.example.com")), Some(&"news2"));
        assert_eq!(trie.len(), 4);
    }
}
