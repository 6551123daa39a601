//! # 条件式エンジン
//!
//! ルーティングルールに付く真偽条件式 (`&&` / `||` / `!` / 括弧 / プリミティブ
//! 呼び出し) を設定ロード時にコンパイルし、リクエストごとに短絡評価します。
//! 未知のプリミティブ・引数の数や型の不一致はすべてロード時エラーです。

pub mod lexer;
pub mod parser;
pub mod primitive;

use crate::proxy::request::GatewayRequest;

use primitive::Compiled;

/// 条件式のロードエラー
#[derive(Debug, Clone)]
pub struct CondError {
    /// 字句・構文エラーの位置 (意味エラーでは None)
    pub pos: Option<usize>,
    pub msg: String,
}

impl CondError {
    pub fn at(pos: usize, msg: impl Into<String>) -> Self {
        Self {
            pos: Some(pos),
            msg: msg.into(),
        }
    }

    pub fn semantic(msg: impl Into<String>) -> Self {
        Self {
            pos: None,
            msg: msg.into(),
        }
    }
}

impl std::fmt::Display for CondError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pos {
            Some(pos) => write!(f, "condition error at {}: {}", pos, self.msg),
            None => write!(f, "condition error: {}", self.msg),
        }
    }
}

impl std::error::Error for CondError {}

/// コンパイル済み条件式
#[derive(Debug, Clone)]
pub struct Condition {
    /// 元の式 (ログ・ステータス表示用)
    pub source: String,
    compiled: Compiled,
}

impl Condition {
    /// 式をコンパイルする
    pub fn build(source: &str) -> Result<Self, CondError> {
        let tokens = lexer::tokenize(source)?;
        let node = parser::parse(&tokens)?;
        let compiled = Compiled::from_node(&node)?;
        Ok(Self {
            source: source.to_string(),
            compiled,
        })
    }

    /// リクエストに対して評価する (副作用なし)
    pub fn matches(&self, req: &GatewayRequest) -> bool {
        self.compiled.eval(req)
    }
}
