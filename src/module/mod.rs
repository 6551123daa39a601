//! # フィルタモジュール
//!
//! リクエストライフサイクルの 5 箇所に差し込まれるコールバック。フェーズ
//! ごとに型付きのフィルタ列を持ち、登録順に呼び出して最初の非 GoOn 判定を
//! 即座に返します。登録はサーブ開始前に終え、以降リストは不変です。

use crate::proxy::request::GatewayRequest;
use crate::proxy::response::GatewayResponse;

/// コールバックフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// プロダクト解決前
    BeforeLocation,
    /// プロダクト確定後
    AfterProduct,
    /// クラスタ確定後
    AfterLocation,
    /// バックエンド確定後・転送直前
    BeforeForward,
    /// バックエンド応答受信後
    OnResponse,
    /// リクエスト完了時
    OnFinish,
}

/// フィルタの判定
pub enum Verdict {
    /// 次のフィルタ (無ければパイプライン続行) へ
    GoOn,
    /// 応答後にコネクションを閉じる
    Finish,
    /// リダイレクトを返す
    Redirect { code: u16, url: String },
    /// このレスポンスを返してバックエンドを迂回する
    Response(GatewayResponse),
    /// 何も返さず即座に切断する
    Close,
}

impl Verdict {
    fn is_go_on(&self) -> bool {
        matches!(self, Verdict::GoOn)
    }
}

/// リクエストを見るフィルタ (BeforeLocation / AfterProduct / AfterLocation)
pub type RequestFilter = Box<dyn Fn(&mut GatewayRequest) -> Verdict + Send + Sync>;
/// 転送直前のフィルタ。レスポンスは差し込めない。
pub type ForwardFilter = Box<dyn Fn(&mut GatewayRequest) -> Verdict + Send + Sync>;
/// レスポンスを見るフィルタ (OnResponse / OnFinish)
pub type ResponseFilter =
    Box<dyn Fn(&mut GatewayRequest, &mut GatewayResponse) -> Verdict + Send + Sync>;

/// 全フェーズのフィルタ列
#[derive(Default)]
pub struct CallbackTable {
    before_location: Vec<RequestFilter>,
    after_product: Vec<RequestFilter>,
    after_location: Vec<RequestFilter>,
    before_forward: Vec<ForwardFilter>,
    on_response: Vec<ResponseFilter>,
    on_finish: Vec<ResponseFilter>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// リクエストフェーズへフィルタを追加する (登録順に実行)
    pub fn add_request_filter(&mut self, phase: Phase, filter: RequestFilter) {
        match phase {
            Phase::BeforeLocation => self.before_location.push(filter),
            Phase::AfterProduct => self.after_product.push(filter),
            Phase::AfterLocation => self.after_location.push(filter),
            _ => panic!("add_request_filter: phase {:?} is not a request phase", phase),
        }
    }

    pub fn add_forward_filter(&mut self, filter: ForwardFilter) {
        self.before_forward.push(filter);
    }

    pub fn add_response_filter(&mut self, phase: Phase, filter: ResponseFilter) {
        match phase {
            Phase::OnResponse => self.on_response.push(filter),
            Phase::OnFinish => self.on_finish.push(filter),
            _ => panic!(
                "add_response_filter: phase {:?} is not a response phase",
                phase
            ),
        }
    }

    /// リクエストフェーズをディスパッチする
    pub fn dispatch_request(&self, phase: Phase, req: &mut GatewayRequest) -> Verdict {
        let filters = match phase {
            Phase::BeforeLocation => &self.before_location,
            Phase::AfterProduct => &self.after_product,
            Phase::AfterLocation => &self.after_location,
            Phase::BeforeForward => &self.before_forward,
            _ => return Verdict::GoOn,
        };
        for filter in filters {
            let verdict = filter(req);
            if !verdict.is_go_on() {
                return verdict;
            }
        }
        Verdict::GoOn
    }

    /// レスポンスフェーズをディスパッチする
    pub fn dispatch_response(
        &self,
        phase: Phase,
        req: &mut GatewayRequest,
        res: &mut GatewayResponse,
    ) -> Verdict {
        let filters = match phase {
            Phase::OnResponse => &self.on_response,
            Phase::OnFinish => &self.on_finish,
            _ => return Verdict::GoOn,
        };
        for filter in filters {
            let verdict = filter(req, res);
            if !verdict.is_go_on() {
                return verdict;
            }
        }
        Verdict::GoOn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn req() -> GatewayRequest {
        GatewayRequest::new(
            "GET".into(),
            "/".into(),
            "https".into(),
            "x.com".into(),
            "HTTP/2.0",
            vec![],
            vec![],
            "127.0.0.1".parse().unwrap(),
            9,
        )
    }

    #[test]
    fn test_dispatch_in_order_until_non_go_on() {
        let mut table = CallbackTable::new();
        let seen = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            table.add_request_filter(
                Phase::BeforeLocation,
                Box::new(move |_| {
                    seen.fetch_add(1, Ordering::Relaxed);
                    if i == 1 {
                        Verdict::Finish
                    } else {
                        Verdict::GoOn
                    }
                }),
            );
        }

        let verdict = table.dispatch_request(Phase::BeforeLocation, &mut req());
        assert!(matches!(verdict, Verdict::Finish));
        // 3 つ目は呼ばれない
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_empty_phase_goes_on() {
        let table = CallbackTable::new();
        assert!(matches!(
            table.dispatch_request(Phase::AfterProduct, &mut req()),
            Verdict::GoOn
        ));
    }

    #[test]
    fn test_response_phase_sees_response() {
        let mut table = CallbackTable::new();
        table.add_response_filter(
            Phase::OnResponse,
            Box::new(|_, res| {
                res.headers
                    .push((b"x-filtered".to_vec(), b"1".to_vec()));
                Verdict::GoOn
            }),
        );

        let mut res = GatewayResponse::new(200);
        table.dispatch_response(Phase::OnResponse, &mut req(), &mut res);
        assert!(res.headers.iter().any(|(n, _)| n == b"x-filtered"));
    }

    #[test]
    fn test_forward_filter_can_abort_forwarding() {
        let mut table = CallbackTable::new();
        table.add_forward_filter(Box::new(|req| {
            if req.backend.is_none() {
                Verdict::Finish
            } else {
                Verdict::GoOn
            }
        }));

        assert!(matches!(
            table.dispatch_request(Phase::BeforeForward, &mut req()),
            Verdict::Finish
        ));
    }

    #[test]
    fn test_redirect_verdict_carries_target() {
        let mut table = CallbackTable::new();
        table.add_request_filter(
            Phase::AfterLocation,
            Box::new(|_| Verdict::Redirect {
                code: 302,
                url: "https://example.com/login".into(),
            }),
        );

        match table.dispatch_request(Phase::AfterLocation, &mut req()) {
            Verdict::Redirect { code, url } => {
                assert_eq!(code, 302);
                assert_eq!(url, "https://example.com/login");
            }
            _ => panic!("expected redirect"),
        }
    }
}
