//! # 条件プリミティブ
//!
//! プリミティブは閉じた表で管理され、名前・引数の数・引数型がロード時に
//! 検査されます。表に無い名前や型違いは設定エラーで、実行時には到達
//! しません。コンパイル後の評価は副作用なしの短絡評価です。

use std::net::IpAddr;

use crate::ipdict::{canonical_ip, Ip16};
use crate::proxy::request::GatewayRequest;

use super::parser::{Literal, Node};
use super::CondError;

/// 引数型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    Bool,
}

/// プリミティブのプロトタイプ表 (名前, 引数型列)
///
/// 表を増やすときは compile_call も合わせて更新すること。
pub const PROTOTYPES: &[(&str, &[ArgKind])] = &[
    ("default_t", &[]),
    ("req_cip_trusted", &[]),
    ("req_host_in", &[ArgKind::Str]),
    ("req_vip_in", &[ArgKind::Str]),
    ("req_proto_match", &[ArgKind::Str]),
    ("req_method_in", &[ArgKind::Str]),
    ("req_path_in", &[ArgKind::Str, ArgKind::Bool]),
    ("req_path_prefix_in", &[ArgKind::Str, ArgKind::Bool]),
    ("req_path_suffix_in", &[ArgKind::Str, ArgKind::Bool]),
    ("req_query_key_in", &[ArgKind::Str]),
    ("req_query_value_in", &[ArgKind::Str, ArgKind::Str, ArgKind::Bool]),
    ("req_cookie_key_in", &[ArgKind::Str]),
    ("req_header_key_in", &[ArgKind::Str]),
    ("req_header_value_in", &[ArgKind::Str, ArgKind::Str, ArgKind::Bool]),
    ("req_cip_range", &[ArgKind::Str, ArgKind::Str]),
    ("req_vip_range", &[ArgKind::Str, ArgKind::Str]),
];

/// コンパイル済みプリミティブ
#[derive(Debug, Clone)]
pub enum Primitive {
    DefaultT,
    CipTrusted,
    HostIn(Vec<String>),
    VipIn(Vec<IpAddr>),
    ProtoMatch(String),
    MethodIn(Vec<String>),
    PathIn(Vec<String>, bool),
    PathPrefixIn(Vec<String>, bool),
    PathSuffixIn(Vec<String>, bool),
    QueryKeyIn(Vec<String>),
    QueryValueIn(String, Vec<String>, bool),
    CookieKeyIn(Vec<String>),
    HeaderKeyIn(Vec<String>),
    HeaderValueIn(String, Vec<String>, bool),
    CipRange(Ip16, Ip16),
    VipRange(Ip16, Ip16),
}

impl Primitive {
    /// リクエストに対して評価する
    pub fn eval(&self, req: &GatewayRequest) -> bool {
        match self {
            Self::DefaultT => true,
            Self::CipTrusted => req.cip_trusted,
            Self::HostIn(hosts) => hosts.iter().any(|h| h == &req.host),
            Self::VipIn(vips) => match req.vip {
                Some(vip) => vips.contains(&vip),
                None => false,
            },
            Self::ProtoMatch(proto) => req.proto == proto,
            Self::MethodIn(methods) => methods.iter().any(|m| m == &req.method),
            Self::PathIn(paths, ci) => {
                str_in(req.path(), paths, *ci, MatchKind::Exact)
            }
            Self::PathPrefixIn(prefixes, ci) => {
                str_in(req.path(), prefixes, *ci, MatchKind::Prefix)
            }
            Self::PathSuffixIn(suffixes, ci) => {
                str_in(req.path(), suffixes, *ci, MatchKind::Suffix)
            }
            Self::QueryKeyIn(keys) => req
                .query_pairs()
                .any(|(k, _)| keys.iter().any(|want| want == k)),
            Self::QueryValueIn(key, values, ci) => req
                .query_pairs()
                .filter(|(k, _)| k == key)
                .any(|(_, v)| str_in(v, values, *ci, MatchKind::Exact)),
            Self::CookieKeyIn(keys) => keys.iter().any(|k| req.cookie(k).is_some()),
            Self::HeaderKeyIn(keys) => keys.iter().any(|k| req.header(k).is_some()),
            Self::HeaderValueIn(key, values, ci) => match req.header(key) {
                Some(value) => match std::str::from_utf8(value) {
                    Ok(value) => str_in(value, values, *ci, MatchKind::Exact),
                    Err(_) => false,
                },
                None => false,
            },
            Self::CipRange(start, end) => ip_in_range(req.client_ip, start, end),
            Self::VipRange(start, end) => match req.vip {
                Some(vip) => ip_in_range(vip, start, end),
                None => false,
            },
        }
    }
}

#[derive(Clone, Copy)]
enum MatchKind {
    Exact,
    Prefix,
    Suffix,
}

fn str_in(subject: &str, patterns: &[String], case_insensitive: bool, kind: MatchKind) -> bool {
    let lowered;
    let subject = if case_insensitive {
        lowered = subject.to_ascii_lowercase();
        lowered.as_str()
    } else {
        subject
    };

    patterns.iter().any(|p| {
        let lowered_p;
        let p = if case_insensitive {
            lowered_p = p.to_ascii_lowercase();
            lowered_p.as_str()
        } else {
            p.as_str()
        };
        match kind {
            MatchKind::Exact => subject == p,
            MatchKind::Prefix => subject.starts_with(p),
            MatchKind::Suffix => subject.ends_with(p),
        }
    })
}

fn ip_in_range(ip: IpAddr, start: &Ip16, end: &Ip16) -> bool {
    let ip = canonical_ip(ip);
    *start <= ip && ip <= *end
}

/// 呼び出しノードをプロトタイプ検査してコンパイルする
pub fn compile_call(name: &str, args: &[Literal]) -> Result<Primitive, CondError> {
    let proto = PROTOTYPES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, kinds)| *kinds)
        .ok_or_else(|| CondError::semantic(format!("primitive {} not found", name)))?;

    if proto.len() != args.len() {
        return Err(CondError::semantic(format!(
            "primitive {} expects {} args, got {}",
            name,
            proto.len(),
            args.len()
        )));
    }
    for (i, (want, got)) in proto.iter().zip(args).enumerate() {
        let matches = matches!(
            (want, got),
            (ArgKind::Str, Literal::Str(_)) | (ArgKind::Bool, Literal::Bool(_))
        );
        if !matches {
            return Err(CondError::semantic(format!(
                "primitive {} arg {} expects {:?}, got {}",
                name,
                i,
                want,
                got.kind()
            )));
        }
    }

    let s = |i: usize| -> String {
        match &args[i] {
            Literal::Str(s) => s.clone(),
            Literal::Bool(_) => unreachable!("checked above"),
        }
    };
    let b = |i: usize| -> bool {
        match &args[i] {
            Literal::Bool(b) => *b,
            Literal::Str(_) => unreachable!("checked above"),
        }
    };
    // '|' 区切りの列挙を分解する
    let list = |i: usize| -> Vec<String> {
        s(i).split('|').map(|p| p.to_string()).collect()
    };

    let prim = match name {
        "default_t" => Primitive::DefaultT,
        "req_cip_trusted" => Primitive::CipTrusted,
        "req_host_in" => {
            Primitive::HostIn(list(0).iter().map(|h| h.to_ascii_lowercase()).collect())
        }
        "req_vip_in" => {
            let mut vips = Vec::new();
            for v in list(0) {
                let ip: IpAddr = v.parse().map_err(|_| {
                    CondError::semantic(format!("req_vip_in: invalid ip {}", v))
                })?;
                vips.push(ip);
            }
            Primitive::VipIn(vips)
        }
        "req_proto_match" => Primitive::ProtoMatch(s(0)),
        "req_method_in" => Primitive::MethodIn(list(0)),
        "req_path_in" => Primitive::PathIn(list(0), b(1)),
        "req_path_prefix_in" => Primitive::PathPrefixIn(list(0), b(1)),
        "req_path_suffix_in" => Primitive::PathSuffixIn(list(0), b(1)),
        "req_query_key_in" => Primitive::QueryKeyIn(list(0)),
        "req_query_value_in" => Primitive::QueryValueIn(s(0), list(1), b(2)),
        "req_cookie_key_in" => Primitive::CookieKeyIn(list(0)),
        "req_header_key_in" => Primitive::HeaderKeyIn(list(0)),
        "req_header_value_in" => Primitive::HeaderValueIn(s(0), list(1), b(2)),
        "req_cip_range" | "req_vip_range" => {
            let parse = |v: &str| -> Result<Ip16, CondError> {
                let ip: IpAddr = v.parse().map_err(|_| {
                    CondError::semantic(format!("{}: invalid ip {}", name, v))
                })?;
                Ok(canonical_ip(ip))
            };
            let start = parse(&s(0))?;
            let end = parse(&s(1))?;
            if start > end {
                return Err(CondError::semantic(format!(
                    "{}: start {} is after end {}",
                    name,
                    s(0),
                    s(1)
                )));
            }
            if name == "req_cip_range" {
                Primitive::CipRange(start, end)
            } else {
                Primitive::VipRange(start, end)
            }
        }
        _ => unreachable!("prototype table covered above"),
    };
    Ok(prim)
}

/// AST 全体をコンパイルして評価可能な条件にする
#[derive(Debug, Clone)]
pub enum Compiled {
    And(Box<Compiled>, Box<Compiled>),
    Or(Box<Compiled>, Box<Compiled>),
    Not(Box<Compiled>),
    Prim(Primitive),
}

impl Compiled {
    pub fn from_node(node: &Node) -> Result<Self, CondError> {
        Ok(match node {
            Node::And(l, r) => {
                Self::And(Box::new(Self::from_node(l)?), Box::new(Self::from_node(r)?))
            }
            Node::Or(l, r) => {
                Self::Or(Box::new(Self::from_node(l)?), Box::new(Self::from_node(r)?))
            }
            Node::Not(inner) => Self::Not(Box::new(Self::from_node(inner)?)),
            Node::Call { name, args } => Self::Prim(compile_call(name, args)?),
        })
    }

    /// 短絡評価
    pub fn eval(&self, req: &GatewayRequest) -> bool {
        match self {
            Self::And(l, r) => l.eval(req) && r.eval(req),
            Self::Or(l, r) => l.eval(req) || r.eval(req),
            Self::Not(inner) => !inner.eval(req),
            Self::Prim(p) => p.eval(req),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http2::hpack::HeaderField;

    fn req() -> GatewayRequest {
        let mut r = GatewayRequest::new(
            "GET".into(),
            "/api/items?q=book&page=2".into(),
            "https".into(),
            "news.example.com".into(),
            "HTTP/2.0",
            vec![
                HeaderField::new(b"user-agent".as_slice(), b"curl/8.0".as_slice()),
                HeaderField::new(b"cookie".as_slice(), b"uid=42".as_slice()),
            ],
            Vec::new(),
            "10.0.0.9".parse().unwrap(),
            40000,
        );
        r.vip = Some("10.1.0.10".parse().unwrap());
        r
    }

    fn compile(expr: &str) -> Compiled {
        let tokens = super::super::lexer::tokenize(expr).unwrap();
        let node = super::super::parser::parse(&tokens).unwrap();
        Compiled::from_node(&node).unwrap()
    }

    #[test]
    fn test_host_in() {
        assert!(compile(r#"req_host_in("a.com|news.example.com")"#).eval(&req()));
        assert!(!compile(r#"req_host_in("a.com|b.com")"#).eval(&req()));
    }

    #[test]
    fn test_path_prefix_case_sensitivity() {
        assert!(compile(r#"req_path_prefix_in("/api/", false)"#).eval(&req()));
        assert!(!compile(r#"req_path_prefix_in("/API/", false)"#).eval(&req()));
        assert!(compile(r#"req_path_prefix_in("/API/", true)"#).eval(&req()));
    }

    #[test]
    fn test_query_primitives() {
        assert!(compile(r#"req_query_key_in("q")"#).eval(&req()));
        assert!(compile(r#"req_query_value_in("q", "book|magazine", false)"#).eval(&req()));
        assert!(!compile(r#"req_query_value_in("q", "pen", false)"#).eval(&req()));
    }

    #[test]
    fn test_header_and_cookie() {
        assert!(compile(r#"req_header_key_in("User-Agent")"#).eval(&req()));
        assert!(compile(r#"req_header_value_in("user-agent", "curl/8.0", false)"#).eval(&req()));
        assert!(compile(r#"req_cookie_key_in("uid")"#).eval(&req()));
        assert!(!compile(r#"req_cookie_key_in("sid")"#).eval(&req()));
    }

    #[test]
    fn test_cip_range() {
        assert!(compile(r#"req_cip_range("10.0.0.1", "10.0.0.20")"#).eval(&req()));
        assert!(!compile(r#"req_cip_range("10.0.1.1", "10.0.1.20")"#).eval(&req()));
    }

    #[test]
    fn test_vip_primitives() {
        assert!(compile(r#"req_vip_in("10.1.0.10")"#).eval(&req()));
        assert!(compile(r#"req_vip_range("10.1.0.0", "10.1.0.255")"#).eval(&req()));
    }

    #[test]
    fn test_boolean_composition_short_circuit() {
        let cond = compile(
            r#"req_host_in("news.example.com") && !req_method_in("POST|PUT") || default_t"#,
        );
        assert!(cond.eval(&req()));
    }

    #[test]
    fn test_unknown_primitive_rejected_at_load() {
        let tokens = super::super::lexer::tokenize(r#"req_frobnicate("x")"#).unwrap();
        let node = super::super::parser::parse(&tokens).unwrap();
        assert!(Compiled::from_node(&node).is_err());
    }

    #[test]
    fn test_arity_and_type_mismatch_rejected() {
        for expr in [
            r#"req_host_in()"#,
            r#"req_host_in("a", "b")"#,
            r#"req_path_in("/x", "yes")"#,
            r#"req_path_in(true, false)"#,
        ] {
            let tokens = super::super::lexer::tokenize(expr).unwrap();
            let node = super::super::parser::parse(&tokens).unwrap();
            assert!(Compiled::from_node(&node).is_err(), "{} should fail", expr);
        }
    }

    #[test]
    fn test_bad_ip_rejected_at_load() {
        let tokens =
            super::super::lexer::tokenize(r#"req_cip_range("10.0.0.300", "10.0.0.1")"#).unwrap();
        let node = super::super::parser::parse(&tokens).unwrap();
        assert!(Compiled::from_node(&node).is_err());
    }
}
