//! 面板 HTTP 客户端
//!
//! 每个请求携带 `action`/`node_id`/`token`（以及可选 `node_type`）。
//! `config` 与 `user` 走条件请求：持有各自的 ETag，304 或响应体
//! SHA-256 与缓存一致时视为未变更（部分面板会换 ETag 不换 body，
//! 哈希兜底）。未变更统一以 `Ok(None)` 表达。

pub mod types;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::common::Error;
use crate::config::ApiConfig;

pub use types::{
    AliveMapBody, CommonNode, DnsEntry, HysteriaNode, IntervalValue, NodeInfo, NodePayload,
    OnlineUser, RawDns, Route, RouteMatch, Rules, Security, ServerPort, ShadowsocksNode,
    TlsSettings, TrojanNode, UserInfo, UserListBody, UserTraffic, VNode,
};

const ACTION_CONFIG: &str = "config";
const ACTION_USER_LIST: &str = "user";
const ACTION_ALIVE_LIST: &str = "alivelist";
const ACTION_PUSH_TRAFFIC: &str = "push";
const ACTION_ALIVE_REPORT: &str = "alive";

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const RETRY_COUNT: usize = 3;
const RETRY_WAIT: Duration = Duration::from_millis(500);
/// 错误响应体截断长度
const ERROR_BODY_LIMIT: usize = 1024;

#[derive(Default)]
struct CacheState {
    node_etag: String,
    user_etag: String,
    body_hash: String,
}

pub struct PanelClient {
    client: reqwest::Client,
    api_host: String,
    token: String,
    node_id: i32,
    /// 留空时从首次 config 响应采纳并固定
    node_type: Mutex<String>,
    cache: Mutex<CacheState>,
}

impl PanelClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let node_type = normalize_node_type(&config.node_type)?;

        let timeout = if config.timeout > 0 {
            Duration::from_secs(config.timeout)
        } else {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        };
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if !config.send_ip.is_empty() {
            let ip: std::net::IpAddr = config
                .send_ip
                .parse()
                .with_context(|| format!("bad send_ip: {}", config.send_ip))?;
            builder = builder.local_address(Some(ip));
        }

        Ok(Self {
            client: builder.build()?,
            api_host: config.host.clone(),
            token: config.token.clone(),
            node_id: config.node_id,
            node_type: Mutex::new(node_type),
            cache: Mutex::new(CacheState::default()),
        })
    }

    pub fn node_id(&self) -> i32 {
        self.node_id
    }

    pub fn api_host(&self) -> &str {
        &self.api_host
    }

    pub fn node_type(&self) -> String {
        self.node_type.lock().expect("node_type lock").clone()
    }

    /// 拼接请求 URL。api_host 可能已带 `?` 或 `&`。
    fn assemble_url(&self, action: &str) -> String {
        let host = &self.api_host;
        let separator = if host.ends_with('?') || host.ends_with('&') {
            ""
        } else if host.contains('?') {
            "&"
        } else {
            "?"
        };
        let mut url = format!(
            "{}{}action={}&node_id={}&token={}",
            host, separator, action, self.node_id, self.token
        );
        let node_type = self.node_type();
        if !node_type.is_empty() {
            url.push_str("&node_type=");
            url.push_str(&node_type);
        }
        url
    }

    /// 瞬时网络错误重试 3 次
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut last_err = None;
        for attempt in 0..RETRY_COUNT {
            match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 < RETRY_COUNT {
                        warn!(attempt = attempt + 1, error = %e, "panel request failed, retrying");
                        tokio::time::sleep(RETRY_WAIT).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("retry loop always records an error").into())
    }

    async fn check_status(&self, action: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().as_u16() >= 400 {
            let url = self.assemble_url(action);
            let body = resp.bytes().await.unwrap_or_default();
            let shown = &body[..body.len().min(ERROR_BODY_LIMIT)];
            return Err(Error::Panel {
                url,
                message: String::from_utf8_lossy(shown).into_owned(),
            }
            .into());
        }
        Ok(resp)
    }

    /// 拉取节点配置。`Ok(None)` 表示未变更。
    pub async fn get_node_info(&self) -> Result<Option<NodeInfo>> {
        let url = self.assemble_url(ACTION_CONFIG);
        let etag = self.cache.lock().expect("cache lock").node_etag.clone();
        let resp = self
            .send_with_retry(|| {
                let mut req = self.client.get(&url);
                if !etag.is_empty() {
                    req = req.header(reqwest::header::IF_NONE_MATCH, &etag);
                }
                req
            })
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        let new_etag = header_string(&resp, reqwest::header::ETAG);
        let resp = self.check_status(ACTION_CONFIG, resp).await?;
        let body = resp.bytes().await?;

        let body_hash = hex_sha256(&body);
        {
            let mut cache = self.cache.lock().expect("cache lock");
            let unchanged = cache.body_hash == body_hash;
            cache.body_hash = body_hash;
            cache.node_etag = new_etag;
            if unchanged {
                return Ok(None);
            }
        }

        // 响应里的 node_type 优先用于解析；客户端未配置类型时
        // 采纳首个响应的类型并固定到后续请求
        let node_type = {
            #[derive(serde::Deserialize)]
            struct TypeDetect {
                #[serde(default)]
                node_type: String,
            }
            let detect: TypeDetect = serde_json::from_slice(&body)
                .map_err(|e| anyhow::anyhow!("decode config response: {}", e))?;
            let from_body = detect.node_type.to_lowercase();
            let pinned = self.node_type();
            if pinned.is_empty() {
                if from_body.is_empty() {
                    anyhow::bail!("node_type not found in panel response");
                }
                *self.node_type.lock().expect("node_type lock") = from_body.clone();
            }
            if from_body.is_empty() {
                pinned
            } else {
                from_body
            }
        };

        NodeInfo::parse(&body, self.node_id, &node_type).map(Some)
    }

    /// 拉取用户列表。`Ok(None)` 表示未变更。
    pub async fn get_user_list(&self) -> Result<Option<Vec<UserInfo>>> {
        let url = self.assemble_url(ACTION_USER_LIST);
        let etag = self.cache.lock().expect("cache lock").user_etag.clone();
        let resp = self
            .send_with_retry(|| {
                let mut req = self
                    .client
                    .get(&url)
                    .header("X-Response-Format", "msgpack");
                if !etag.is_empty() {
                    req = req.header(reqwest::header::IF_NONE_MATCH, &etag);
                }
                req
            })
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        let new_etag = header_string(&resp, reqwest::header::ETAG);
        let resp = self.check_status(ACTION_USER_LIST, resp).await?;

        let content_type = header_string(&resp, reqwest::header::CONTENT_TYPE);
        let body = resp.bytes().await?;
        let list: UserListBody = if content_type.contains("application/x-msgpack") {
            rmp_serde::from_slice(&body)
                .map_err(|e| anyhow::anyhow!("decode user list error: {}", e))?
        } else {
            serde_json::from_slice(&body)
                .map_err(|e| anyhow::anyhow!("decode user list error: {}", e))?
        };

        self.cache.lock().expect("cache lock").user_etag = new_etag;
        Ok(Some(list.users))
    }

    /// 拉取面板侧在线设备计数。任何失败都退化为空表，不报错。
    pub async fn get_user_alive(&self) -> HashMap<i32, i32> {
        let url = self.assemble_url(ACTION_ALIVE_LIST);
        let resp = match self.send_with_retry(|| self.client.get(&url)).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "get alive list failed, using empty map");
                return HashMap::new();
            }
        };
        if resp.status().as_u16() >= 400 {
            return HashMap::new();
        }
        match resp.json::<AliveMapBody>().await {
            Ok(body) => body.alive,
            Err(e) => {
                warn!(error = %e, "decode alive list failed, using empty map");
                HashMap::new()
            }
        }
    }

    /// 上报用户流量：`{uid: [up, down]}`
    pub async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()> {
        let url = self.assemble_url(ACTION_PUSH_TRAFFIC);
        let data: HashMap<i32, [i64; 2]> = traffic
            .iter()
            .map(|t| (t.uid, [t.upload, t.download]))
            .collect();
        let resp = self
            .send_with_retry(|| self.client.post(&url).json(&data))
            .await?;
        self.check_status(ACTION_PUSH_TRAFFIC, resp).await?;
        Ok(())
    }

    /// 上报在线设备：`{uid: [ip, ...]}`
    pub async fn report_node_online_users(&self, data: &HashMap<i32, Vec<String>>) -> Result<()> {
        let url = self.assemble_url(ACTION_ALIVE_REPORT);
        let resp = self
            .send_with_retry(|| self.client.post(&url).json(data))
            .await?;
        self.check_status(ACTION_ALIVE_REPORT, resp).await?;
        Ok(())
    }
}

fn normalize_node_type(raw: &str) -> Result<String> {
    let node_type = raw.to_lowercase();
    let node_type = match node_type.as_str() {
        "v2ray" => "vmess".to_string(),
        "" | "vmess" | "vless" | "trojan" | "shadowsocks" | "hysteria" | "hysteria2" | "tuic"
        | "anytls" => node_type,
        other => anyhow::bail!("unsupported node type: {}", other),
    };
    Ok(node_type)
}

fn header_string(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> String {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn hex_sha256(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_host(host: &str) -> PanelClient {
        PanelClient::new(&ApiConfig {
            host: host.to_string(),
            token: "tok".to_string(),
            node_id: 5,
            node_type: "vmess".to_string(),
            timeout: 0,
            send_ip: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn assemble_url_plain_host() {
        let c = client_with_host("https://p.example.com/api");
        assert_eq!(
            c.assemble_url("config"),
            "https://p.example.com/api?action=config&node_id=5&token=tok&node_type=vmess"
        );
    }

    #[test]
    fn assemble_url_host_with_query() {
        let c = client_with_host("https://p.example.com/api?key=1");
        assert!(c.assemble_url("user").starts_with("https://p.example.com/api?key=1&action=user"));
    }

    #[test]
    fn assemble_url_host_trailing_separator() {
        let c = client_with_host("https://p.example.com/api?");
        assert!(c
            .assemble_url("push")
            .starts_with("https://p.example.com/api?action=push"));
        let c = client_with_host("https://p.example.com/api?a=1&");
        assert!(c
            .assemble_url("push")
            .starts_with("https://p.example.com/api?a=1&action=push"));
    }

    #[test]
    fn node_type_alias_and_rejects() {
        assert_eq!(normalize_node_type("V2ray").unwrap(), "vmess");
        assert_eq!(normalize_node_type("").unwrap(), "");
        assert!(normalize_node_type("socks").is_err());
    }

    #[test]
    fn sha256_hex_stable() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
