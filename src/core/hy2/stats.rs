//! Hysteria2 trafficStats 接口客户端
//!
//! `GET /traffic?clear=1` 原子地取值并清零；`GET /online` 列在线
//! 用户；`POST /kick?id=UUID` 踢人。配置了 secret 时带
//! Authorization 头。

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::panel::UserTraffic;

const STATS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
pub struct TrafficStatsResponse {
    #[serde(default)]
    pub users: HashMap<String, UserTrafficStats>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UserTrafficStats {
    /// 上行（发往远端）
    #[serde(default)]
    pub tx: u64,
    /// 下行（远端发回）
    #[serde(default)]
    pub rx: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct OnlineUsersResponse {
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Clone)]
pub struct StatsClient {
    base_url: String,
    secret: String,
    client: reqwest::Client,
}

impl StatsClient {
    pub fn new(base_url: String, secret: String) -> Self {
        Self {
            base_url,
            secret,
            client: reqwest::Client::builder()
                .timeout(STATS_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if !self.secret.is_empty() {
            req = req.header(reqwest::header::AUTHORIZATION, &self.secret);
        }
        req
    }

    /// 拉取各用户流量；`clear` 为真时服务端取值并清零
    pub async fn get_traffic(&self, clear: bool) -> Result<TrafficStatsResponse> {
        let mut url = format!("{}/traffic", self.base_url);
        if clear {
            url.push_str("?clear=1");
        }
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .context("get traffic stats")?;
        if !resp.status().is_success() {
            anyhow::bail!("traffic API returned {}", resp.status());
        }
        resp.json().await.context("decode traffic stats")
    }

    pub async fn get_online(&self) -> Result<OnlineUsersResponse> {
        let resp = self
            .request(reqwest::Method::GET, format!("{}/online", self.base_url))
            .send()
            .await
            .context("get online users")?;
        if !resp.status().is_success() {
            anyhow::bail!("online API returned {}", resp.status());
        }
        resp.json().await.context("decode online users")
    }

    pub async fn kick(&self, uuid: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, format!("{}/kick", self.base_url))
            .query(&[("id", uuid)])
            .send()
            .await
            .context("kick user")?;
        if !resp.status().is_success() {
            anyhow::bail!("kick API returned {}", resp.status());
        }
        Ok(())
    }
}

/// 统计响应换算成上报格式；过滤掉无流量与未知用户
pub fn to_user_traffic(
    stats: &TrafficStatsResponse,
    user_map: &HashMap<String, i32>,
) -> Vec<UserTraffic> {
    let mut out = Vec::new();
    for (uuid, traffic) in &stats.users {
        let Some(&uid) = user_map.get(uuid) else {
            continue;
        };
        if traffic.tx == 0 && traffic.rx == 0 {
            continue;
        }
        out.push(UserTraffic {
            uid,
            upload: traffic.tx as i64,
            download: traffic.rx as i64,
        });
    }
    out
}
