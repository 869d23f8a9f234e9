use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use minerwatch_rs::adapters::{HttpDigestAdapter, HttpJsonAdapter, MinerAdapter};
use minerwatch_rs::device::{Credentials, DeviceType};
use minerwatch_rs::error::FetchError;
use minerwatch_rs::protocol::DigestChallenge;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const CHALLENGE: &str = r#"Digest realm="antMiner Configuration", nonce="5f2a8c1e9b", qop="auth""#;

/// 在随机端口启动模拟固件，返回 `host:port`
async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

fn system_info(version: &str, mode: &str) -> Value {
    json!({
        "hostname": "bitaxe-cluster",
        "ASICModel": "BM1370",
        "version": version,
        "clusterMode": mode,
        "hashRate": 1100.5,
        "temp": 61.0,
        "power": 18.2,
        "efficiency": 0,
        "sharesAccepted": 410,
        "sharesRejected": 2,
        "bestDiff": "1.5G",
        "bestSessionDiff": "20.1M",
        "stratumDifficulty": "4K",
        "stratumURL": "stratum+tcp://solo.example.org:3333",
        "stratumUser": "bc1qexample.worker"
    })
}

fn extract_cnonce(authorization: &str) -> Option<String> {
    let start = authorization.find("cnonce=\"")? + "cnonce=\"".len();
    let end = authorization[start..].find('"')? + start;
    Some(authorization[start..end].to_string())
}

/// 校验 Digest 头，口令为 root/root
fn check_digest(headers: &HeaderMap, uri: &str) -> bool {
    let Some(authorization) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(cnonce) = extract_cnonce(authorization) else {
        return false;
    };
    let challenge = DigestChallenge::parse(CHALLENGE).unwrap();
    let expected = challenge
        .authorization_with_cnonce("GET", uri, "root", "root", &cnonce)
        .unwrap();
    authorization == expected
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, CHALLENGE)]).into_response()
}

fn antminer_app(unauthenticated: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/cgi-bin/get_miner_status.cgi",
            get(move |headers: HeaderMap| {
                let unauthenticated = unauthenticated.clone();
                async move {
                    if !check_digest(&headers, "/cgi-bin/get_miner_status.cgi") {
                        unauthenticated.fetch_add(1, Ordering::SeqCst);
                        return unauthorized();
                    }
                    Json(json!({
                        "summary": {"elapsed": 7200, "ghs5s": "13612.08", "accepted": 8100, "rejected": 9, "bestshare": 90071992},
                        "pools": [
                            {"url": "stratum+tcp://btc.example.com:443", "user": "farm.s9", "status": "Alive", "diff": "16K"}
                        ],
                        "devs": [
                            {"index": 6, "chain_acn": 63, "freq": "650", "rate": "4537.1", "temp": "63", "temp2": "79", "power": 440, "fan3": "5760"},
                            {"index": 7, "chain_acn": 63, "freq": "650", "rate": "4537.4", "temp": "65", "temp2": "80", "power": 445, "fan6": "5880"},
                            {"index": 8, "chain_acn": 63, "freq": "650", "rate": "4537.5", "temp": "62", "temp2": "77", "power": 450}
                        ]
                    }))
                    .into_response()
                }
            }),
        )
        .route(
            "/cgi-bin/get_system_info.cgi",
            get(|headers: HeaderMap| async move {
                if !check_digest(&headers, "/cgi-bin/get_system_info.cgi") {
                    return unauthorized();
                }
                Json(json!({"minertype": "Antminer S9j", "hostname": "antMiner-rack4"})).into_response()
            }),
        )
}

#[tokio::test]
async fn test_http_json_standalone() {
    let app = Router::new().route(
        "/api/system/info",
        get(|| async { Json(system_info("v2.4.1", "standalone")) }),
    );
    let address = serve(app).await;

    let adapter = HttpJsonAdapter::new(Duration::from_secs(2));
    let snapshot = adapter.fetch(&address, None).await.unwrap();

    assert_eq!(snapshot.vendor, DeviceType::HttpJson);
    assert_eq!(snapshot.model, "BM1370");
    assert_eq!(snapshot.hashrate, 1100.5);
    assert_eq!(snapshot.best_difficulty, 1.5e9);
    assert_eq!(snapshot.pool_difficulty, 4000.0);
    assert_eq!(snapshot.pool_host, "solo.example.org");
    assert_eq!(snapshot.pool_port, 3333);
    assert!(snapshot.cluster.is_none());
    // 厂商能效为 0 时自行计算
    assert!((snapshot.efficiency - 18.2 / 1.1005).abs() < 1e-9);
}

#[tokio::test]
async fn test_http_json_cluster_master() {
    let app = Router::new()
        .route(
            "/api/system/info",
            get(|| async { Json(system_info("v2.4.1-ClusterAxe", "master")) }),
        )
        .route(
            "/api/cluster/status",
            get(|| async {
                Json(json!({
                    "totalHashrate": 330000,
                    "totalPower": 54.6,
                    "totalSharesAccepted": 1230,
                    "totalSharesRejected": 6,
                    "activeSlaves": 2
                }))
            }),
        );
    let address = serve(app).await;

    let snapshot = HttpJsonAdapter::new(Duration::from_secs(2))
        .fetch(&address, None)
        .await
        .unwrap();

    assert_eq!(snapshot.hashrate, 3300.0);
    assert_eq!(snapshot.power, 54.6);
    assert_eq!(snapshot.accepted_shares, 1230);
    assert_eq!(snapshot.rejected_shares, 6);
    let cluster = snapshot.cluster.expect("cluster summary");
    assert_eq!(cluster.active_members, 2);
    assert!(snapshot.raw.get("cluster_status").is_some());
}

#[tokio::test]
async fn test_http_json_server_error() {
    let app = Router::new().route(
        "/api/system/info",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let address = serve(app).await;

    let result = HttpJsonAdapter::new(Duration::from_secs(2)).fetch(&address, None).await;
    assert!(matches!(result, Err(FetchError::Http { status: 500, .. })));
}

#[tokio::test]
async fn test_http_digest_authenticated_fetch() {
    let unauthenticated = Arc::new(AtomicUsize::new(0));
    let address = serve(antminer_app(unauthenticated.clone())).await;
    let adapter = HttpDigestAdapter::new(Duration::from_secs(2));

    let credentials = Credentials::new("root", "root");
    let snapshot = adapter.fetch(&address, Some(&credentials)).await.unwrap();

    assert_eq!(snapshot.vendor, DeviceType::HttpDigest);
    assert_eq!(snapshot.model, "Antminer S9j");
    assert_eq!(snapshot.hostname, "antMiner-rack4");
    assert!((snapshot.hashrate - 13612.08).abs() < 1e-9);
    assert_eq!(snapshot.power, 1335.0);
    assert_eq!(snapshot.temperature, 80.0);
    assert_eq!(snapshot.fan_rpm, 5880.0);
    assert_eq!(snapshot.boards.len(), 3);
    assert_eq!(snapshot.pool_difficulty, 16_000.0);
    // 没有链电压时使用回退值
    assert_eq!(snapshot.voltage, 8500.0);
    assert_eq!(snapshot.best_difficulty, 90071992.0);

    // 每个接口都是先匿名请求一次
    assert_eq!(unauthenticated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_http_digest_credentials_errors() {
    let address = serve(antminer_app(Arc::new(AtomicUsize::new(0)))).await;
    let adapter = HttpDigestAdapter::new(Duration::from_secs(2));

    let result = adapter.fetch(&address, None).await;
    assert!(matches!(result, Err(FetchError::AuthenticationRequired { .. })));

    let wrong = Credentials::new("root", "hunter2");
    let result = adapter.fetch(&address, Some(&wrong)).await;
    assert!(matches!(result, Err(FetchError::AuthenticationFailed { .. })));

    assert!(adapter.requires_authentication(&address).await);
}

#[tokio::test]
async fn test_http_json_device_does_not_demand_auth() {
    let app = Router::new().route(
        "/api/system/info",
        get(|| async { Json(system_info("v2.4.1", "standalone")) }),
    );
    let address = serve(app).await;

    // 没有 CGI 接口，返回 404 而不是 401
    let adapter = HttpDigestAdapter::new(Duration::from_secs(2));
    assert!(!adapter.requires_authentication(&address).await);
    assert!(matches!(
        adapter.fetch(&address, None).await,
        Err(FetchError::Http { status: 404, .. })
    ));
}
