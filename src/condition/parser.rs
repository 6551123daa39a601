//! # 条件式の構文解析
//!
//! トークン列から AST を組み立てます。優先順位は `!` > `&&` > `||`、
//! 短絡評価は AST を評価する側 (primitive モジュール) が行います。

use super::lexer::Token;
use super::CondError;

/// リテラル引数
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Str(String),
    Bool(bool),
}

impl Literal {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "STRING",
            Self::Bool(_) => "BOOL",
        }
    }
}

/// 条件式 AST
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    /// プリミティブ呼び出し。引数なしはパーレン省略可。
    Call { name: String, args: Vec<Literal> },
}

/// トークン列をパースして AST を返す
pub fn parse(tokens: &[Token]) -> Result<Node, CondError> {
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.or_expr()?;
    if parser.pos != tokens.len() {
        return Err(CondError::at(
            parser.pos,
            format!("unexpected trailing token {}", tokens[parser.pos]),
        ));
    }
    Ok(node)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: &Token) -> Result<(), CondError> {
        match self.bump() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(CondError::at(
                self.pos - 1,
                format!("expected {} but found {}", want, t),
            )),
            None => Err(CondError::at(
                self.pos,
                format!("expected {} but input ended", want),
            )),
        }
    }

    fn or_expr(&mut self) -> Result<Node, CondError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let right = self.and_expr()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Node, CondError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let right = self.unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Node, CondError> {
        match self.peek() {
            Some(Token::Not) => {
                self.bump();
                Ok(Node::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.bump();
                let inner = self.or_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(_)) => self.call(),
            Some(t) => Err(CondError::at(
                self.pos,
                format!("expected expression but found {}", t),
            )),
            None => Err(CondError::at(self.pos, "expected expression but input ended")),
        }
    }

    fn call(&mut self) -> Result<Node, CondError> {
        let name = match self.bump() {
            Some(Token::Ident(name)) => name.clone(),
            _ => unreachable!("call() is entered on Ident"),
        };

        // 引数なしプリミティブは括弧を省略できる
        if self.peek() != Some(&Token::LParen) {
            return Ok(Node::Call {
                name,
                args: Vec::new(),
            });
        }
        self.bump();

        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.bump();
            return Ok(Node::Call { name, args });
        }

        loop {
            match self.bump() {
                Some(Token::Str(s)) => args.push(Literal::Str(s.clone())),
                Some(Token::Bool(b)) => args.push(Literal::Bool(*b)),
                Some(t) => {
                    return Err(CondError::at(
                        self.pos - 1,
                        format!("expected literal argument but found {}", t),
                    ))
                }
                None => {
                    return Err(CondError::at(self.pos, "unterminated argument list"))
                }
            }
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                Some(t) => {
                    return Err(CondError::at(
                        self.pos - 1,
                        format!("expected ',' or ')' but found {}", t),
                    ))
                }
                None => {
                    return Err(CondError::at(self.pos, "unterminated argument list"))
                }
            }
        }

        Ok(Node::Call { name, args })
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse_str(s: &str) -> Result<Node, CondError> {
        parse(&tokenize(s).unwrap())
    }

    #[test]
    fn test_call_with_args() {
        let node = parse_str(r#"req_path_prefix_in("/api/", false)"#).unwrap();
        assert_eq!(
            node,
            Node::Call {
                name: "req_path_prefix_in".into(),
                args: vec![Literal::Str("/api/".into()), Literal::Bool(false)],
            }
        );
    }

    #[test]
    fn test_no_paren_call() {
        let node = parse_str("default_t").unwrap();
        assert_eq!(
            node,
            Node::Call {
                name: "default_t".into(),
                args: vec![],
            }
        );
    }

    #[test]
    fn test_precedence_not_over_and_over_or() {
        // a || !b && c  =>  Or(a, And(Not(b), c))
        let node = parse_str("a || !b && c").unwrap();
        match node {
            Node::Or(left, right) => {
                assert!(matches!(*left, Node::Call { .. }));
                match *right {
                    Node::And(l, r) => {
                        assert!(matches!(*l, Node::Not(_)));
                        assert!(matches!(*r, Node::Call { .. }));
                    }
                    other => panic!("expected And, got {:?}", other),
                }
            }
            other => panic!("expected Or, got {:?}", other),
        }
    }

    #[test]
    fn test_parens_change_grouping() {
        let node = parse_str("(a || b) && c").unwrap();
        assert!(matches!(node, Node::And(_, _)));
    }

    #[test]
    fn test_errors() {
        assert!(parse_str("").is_err());
        assert!(parse_str("a &&").is_err());
        assert!(parse_str("(a").is_err());
        assert!(parse_str(r#"f(g())"#).is_err());
        assert!(parse_str("a b").is_err());
    }
}
