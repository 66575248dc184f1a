//! Hysteria2 子进程核心的端到端测试
//!
//! 用 sleep 脚本顶替 hysteria 可执行文件：验证 YAML 落盘、用户
//! 变更时的重写与重启、DelNode 的清理，以及 trafficStats 客户端
//! 的鉴权与 clear 语义。

mod common;

use std::sync::Arc;

use edgeward::cert::CertService;
use edgeward::config::{ApiConfig, Hy2Config, Options};
use edgeward::core::hy2::config::sanitize_filename;
use edgeward::core::hy2::stats::StatsClient;
use edgeward::core::hy2::Hy2Core;
use edgeward::core::{Core, Selector};
use edgeward::node::Controller;
use edgeward::panel::PanelClient;

use common::{start_panel, PanelState};

const UUID_A: &str = "9a1f4c3e-0b6d-4f7a-8123-47a2b5c60001";
const UUID_B: &str = "9a1f4c3e-0b6d-4f7a-8123-47a2b5c60002";

fn fake_binary(dir: &std::path::Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("hysteria");
    std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_str().unwrap().to_string()
}

fn hy2_state() -> PanelState {
    PanelState {
        config: serde_json::json!({
            "node_type": "hysteria2",
            "host": "hy2.example.com",
            "server_port": "30000-30100",
            "up_mbps": 100,
            "down_mbps": 100,
            "routes": [],
            "base_config": {"pull_interval": 60, "push_interval": 60}
        }),
        config_etag: "hy2-v1".to_string(),
        users: serde_json::json!({"users": [
            {"id": 1, "uuid": UUID_A, "speed_limit": 0, "device_limit": 0},
            {"id": 2, "uuid": UUID_B, "speed_limit": 0, "device_limit": 0},
        ]}),
        users_etag: "usr-v1".to_string(),
        alive: serde_json::json!({"alive": {}}),
        ..Default::default()
    }
}

#[tokio::test]
async fn controller_drives_subprocess_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let panel = start_panel(hy2_state()).await;

    let hy2 = Hy2Core::new(Hy2Config {
        binary_path: fake_binary(dir.path()),
        config_dir: dir.path().join("conf").to_str().unwrap().to_string(),
        stats_secret: String::new(),
    });
    let selector: Arc<dyn Core> = Arc::new(Selector::new(vec![Arc::new(hy2)]));
    selector.start().await.unwrap();

    let api = Arc::new(
        PanelClient::new(&ApiConfig {
            host: format!("http://{}", panel.addr),
            token: "t".to_string(),
            node_id: 201,
            node_type: String::new(),
            timeout: 0,
            send_ip: String::new(),
        })
        .unwrap(),
    );
    let controller = Controller::new(
        selector.clone(),
        api,
        Options::default(),
        Arc::new(CertService::new(None)),
    );
    controller.start().await.unwrap();

    let tag = controller.tag();
    assert!(tag.contains("-hysteria2:201"));
    let config_path = dir
        .path()
        .join("conf")
        .join(format!("{}.yaml", sanitize_filename(&tag)));
    let content = std::fs::read_to_string(&config_path).unwrap();
    // 端口段的段首作为监听端口，userpass 表 uuid→uuid
    assert!(content.contains(":30000"));
    assert!(content.contains(UUID_A));
    assert!(content.contains(UUID_B));
    assert!(content.contains("userpass"));
    // trafficStats 端口按 25590 + id % 1000 推导
    assert!(content.contains("127.0.0.1:25791"));

    // 统计端口没人监听：切片为空但不报错
    assert!(selector.user_traffic_slice(&tag, true).await.is_empty());

    // 面板删掉 B：YAML 重写
    {
        let mut s = panel.state.lock().unwrap();
        s.users = serde_json::json!({"users": [
            {"id": 1, "uuid": UUID_A, "speed_limit": 0, "device_limit": 0},
        ]});
        s.users_etag = "usr-v2".to_string();
    }
    controller.monitor_once().await;
    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains(UUID_A));
    assert!(!content.contains(UUID_B));

    controller.close().await.unwrap();
    assert!(!config_path.exists());
}

#[tokio::test]
async fn stats_client_sends_auth_and_clear() {
    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Seen {
        auth: Option<String>,
        cleared: bool,
        kicked: Option<String>,
    }
    let seen = Arc::new(Mutex::new(Seen::default()));

    let traffic_seen = seen.clone();
    let kick_seen = seen.clone();
    let app = axum::Router::new()
        .route(
            "/traffic",
            get(
                move |Query(q): Query<HashMap<String, String>>, headers: HeaderMap| {
                    let seen = traffic_seen.clone();
                    async move {
                        let mut s = seen.lock().unwrap();
                        s.auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        s.cleared = q.get("clear").map(|v| v == "1").unwrap_or(false);
                        axum::Json(serde_json::json!({"users": {"u1": {"tx": 7, "rx": 9}}}))
                    }
                },
            ),
        )
        .route(
            "/kick",
            axum::routing::post(move |Query(q): Query<HashMap<String, String>>| {
                let seen = kick_seen.clone();
                async move {
                    seen.lock().unwrap().kicked = q.get("id").cloned();
                    axum::Json(serde_json::json!({}))
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = StatsClient::new(format!("http://{}", addr), "s3cret".to_string());
    let stats = client.get_traffic(true).await.unwrap();
    assert_eq!(stats.users["u1"].tx, 7);
    client.kick("u1").await.unwrap();

    let s = seen.lock().unwrap();
    assert_eq!(s.auth.as_deref(), Some("s3cret"));
    assert!(s.cleared);
    assert_eq!(s.kicked.as_deref(), Some("u1"));
}
