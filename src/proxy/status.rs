//! # ステータスエンドポイント
//!
//! 現在のスナップショットのバージョンと各テーブルのサイズ、プロキシ統計を
//! JSON で返します。`/sekisho/status` への BeforeLocation フィルタとして
//! 登録されます。

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::SnapshotHolder;
use crate::module::{CallbackTable, Phase, Verdict};
use crate::proxy::pipeline::PROXY_STATE;
use crate::proxy::response::GatewayResponse;

/// ステータス応答のパス
pub const STATUS_PATH: &str = "/sekisho/status";

/// ステータス JSON を組み立てる
pub fn status_response(holder: &SnapshotHolder) -> GatewayResponse {
    let snapshot = holder.load();
    let tables = snapshot.host_table.status();
    let versions = snapshot.host_table.versions();
    let state = &*PROXY_STATE;

    let clusters: serde_json::Map<String, serde_json::Value> = snapshot
        .clusters
        .iter()
        .map(|(name, cluster)| {
            let backends: usize = cluster
                .balancer
                .subclusters
                .iter()
                .map(|sc| sc.backends.len())
                .sum();
            let healthy: usize = cluster
                .balancer
                .subclusters
                .iter()
                .map(|sc| sc.healthy_count())
                .sum();
            let requests = state
                .cluster_requests
                .get(name)
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0);
            (
                name.clone(),
                serde_json::json!({
                    "subclusters": cluster.balancer.subclusters.len(),
                    "backends": backends,
                    "healthy_backends": healthy,
                    "requests": requests,
                }),
            )
        })
        .collect();

    let payload = serde_json::json!({
        "version": snapshot.version,
        "versions": {
            "host_tag": versions.host_tag,
            "vip": versions.vip,
            "product_route": versions.product_route,
        },
        "tables": {
            "host": tables.host_table_size,
            "host_tag": tables.host_tag_table_size,
            "vip": tables.vip_table_size,
            "product_route": tables.product_route_table_size,
            "trusted_proxies": snapshot.trusted_proxies.len(),
        },
        "clusters": clusters,
        "state": {
            "total_requests": state.total_requests.load(Ordering::Relaxed),
            "err_find_product": state.err_bk_find_product.load(Ordering::Relaxed),
            "err_find_location": state.err_bk_find_location.load(Ordering::Relaxed),
            "err_no_balance": state.err_bk_no_balance.load(Ordering::Relaxed),
            "err_connect_backend": state.err_bk_connect_backend.load(Ordering::Relaxed),
            "err_client_write": state.err_client_write.load(Ordering::Relaxed),
            "req_with_retry": state.req_with_retry.load(Ordering::Relaxed),
            "req_with_cross_retry": state.req_with_cross_retry.load(Ordering::Relaxed),
        },
    });

    let mut res = GatewayResponse::new(200);
    res.headers
        .push((b"content-type".to_vec(), b"application/json".to_vec()));
    res.body = serde_json::to_vec_pretty(&payload).unwrap_or_default();
    res
}

/// ステータスフィルタを登録する
pub fn register(callbacks: &mut CallbackTable, holder: Arc<SnapshotHolder>) {
    callbacks.add_request_filter(
        Phase::BeforeLocation,
        Box::new(move |req| {
            if req.path() == STATUS_PATH {
                Verdict::Response(status_response(&holder))
            } else {
                Verdict::GoOn
            }
        }),
    );
}

/// 設定リロードのパス
pub const RELOAD_PATH: &str = "/sekisho/reload";

/// リロードフィルタを登録する
///
/// 設定を読み直して検証し、成功した場合のみスナップショットを差し替えます。
/// 進行中のリクエストは古いスナップショットで完走します。
pub fn register_reload(
    callbacks: &mut CallbackTable,
    holder: Arc<SnapshotHolder>,
    config_path: std::path::PathBuf,
) {
    use crate::config::{build_snapshot, FileConfig};

    callbacks.add_request_filter(
        Phase::BeforeLocation,
        Box::new(move |req| {
            if req.path() != RELOAD_PATH {
                return Verdict::GoOn;
            }
            if req.method != "POST" {
                return Verdict::Response(GatewayResponse::new(405));
            }

            let reloaded = FileConfig::load(&config_path).and_then(|c| build_snapshot(&c));
            match reloaded {
                Ok(snapshot) => {
                    let version = snapshot.version.clone();
                    holder.swap(snapshot);
                    ftlog::info!("[config] snapshot reloaded: version={}", version);
                    let mut res = GatewayResponse::new(200);
                    res.headers
                        .push((b"content-type".to_vec(), b"application/json".to_vec()));
                    res.body = serde_json::json!({ "reloaded": version })
                        .to_string()
                        .into_bytes();
                    Verdict::Response(res)
                }
                Err(e) => {
                    ftlog::error!("[config] reload failed: {:#}", e);
                    let mut res = GatewayResponse::new(500);
                    res.body = format!("reload failed: {:#}", e).into_bytes();
                    Verdict::Response(res)
                }
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build_snapshot, FileConfig};
    use crate::proxy::request::GatewayRequest;

    const CONFIG: &str = r#"
        [server]
        listen = "127.0.0.1:8443"

        [routing]
        version = "status-v9"
        default_product = "p"

        [[routing.products.p]]
        cond = "default_t"
        cluster = "c"

        [clusters.c]
        timeout_conn_srv = 1000
        timeout_response_header = 5000
        timeout_read_client = 30000
        timeout_read_client_again = 60000
        timeout_write_client = 60000

        [clusters.c.check]
        schem = "tcp"
        fail_num = 3
        check_interval = 3000

        [[clusters.c.subclusters]]
        name = "bj"
        backends = [
            { name = "b0", addr = "10.0.0.1", port = 8080 },
        ]
    "#;

    fn holder() -> Arc<SnapshotHolder> {
        let config: FileConfig = toml::from_str(CONFIG).unwrap();
        Arc::new(SnapshotHolder::new(build_snapshot(&config).unwrap()))
    }

    #[test]
    fn test_status_payload() {
        let res = status_response(&holder());
        assert_eq!(res.status, 200);

        let payload: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
        assert_eq!(payload["version"], "status-v9");
        assert_eq!(payload["clusters"]["c"]["backends"], 1);
        assert_eq!(payload["clusters"]["c"]["healthy_backends"], 1);
    }

    #[test]
    fn test_register_intercepts_status_path() {
        let mut callbacks = CallbackTable::new();
        register(&mut callbacks, holder());

        let mut req = GatewayRequest::new(
            "GET".into(),
            STATUS_PATH.into(),
            "https".into(),
            "any.host".into(),
            "HTTP/2.0",
            vec![],
            vec![],
            "127.0.0.1".parse().unwrap(),
            1,
        );
        match callbacks.dispatch_request(Phase::BeforeLocation, &mut req) {
            Verdict::Response(res) => assert_eq!(res.status, 200),
            _ => panic!("expected status response"),
        }

        // 他のパスは素通り
        req.uri = "/other".into();
        assert!(matches!(
            callbacks.dispatch_request(Phase::BeforeLocation, &mut req),
            Verdict::GoOn
        ));
    }
}
