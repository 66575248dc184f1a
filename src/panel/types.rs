//! 面板下发数据的线上类型
//!
//! `config` 响应按 node_type 分型解码，公共字段（host、端口、路由、
//! 基础间隔）在 `CommonNode`。历史别名 `networkSettings`/`tlsSettings`
//! 与规范名并存时取规范名。

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

/// 节点安全层
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    None,
    Tls,
    Reality,
}

impl From<i32> for Security {
    fn from(v: i32) -> Self {
        match v {
            1 => Security::Tls,
            2 => Security::Reality,
            _ => Security::None,
        }
    }
}

/// 一次成功 config 拉取得到的节点快照
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: i32,
    pub node_type: String,
    pub security: Security,
    pub push_interval: Duration,
    pub pull_interval: Duration,
    pub raw_dns: RawDns,
    pub rules: Rules,
    pub common: CommonNode,
    pub payload: NodePayload,
}

/// 协议相关的变体载荷
#[derive(Debug, Clone)]
pub enum NodePayload {
    /// vmess / vless 共用
    V(VNode),
    Shadowsocks(ShadowsocksNode),
    Trojan(TrojanNode),
    /// hysteria / hysteria2 共用
    Hysteria(HysteriaNode),
    /// tuic / anytls 等仅有公共字段的类型
    Common,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommonNode {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub server_port: ServerPort,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub base_config: Option<BaseConfig>,
}

/// 监听端口。hysteria2 可能下发 "start-end" 端口段，此时监听段首
/// 并启用端口跳跃。
#[derive(Debug, Clone, Default)]
pub struct ServerPort {
    pub port: u16,
    pub range: Option<(u16, u16)>,
}

impl<'de> Deserialize<'de> for ServerPort {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u16),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(port) => Ok(ServerPort { port, range: None }),
            Raw::Str(s) => {
                if let Some((start, end)) = s.split_once('-') {
                    let start: u16 = start
                        .trim()
                        .parse()
                        .map_err(|_| serde::de::Error::custom("bad port range start"))?;
                    let end: u16 = end
                        .trim()
                        .parse()
                        .map_err(|_| serde::de::Error::custom("bad port range end"))?;
                    Ok(ServerPort {
                        port: start,
                        range: Some((start, end)),
                    })
                } else {
                    let port: u16 = s
                        .trim()
                        .parse()
                        .map_err(|_| serde::de::Error::custom("bad port"))?;
                    Ok(ServerPort { port, range: None })
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub id: i32,
    #[serde(rename = "match")]
    pub matches: RouteMatch,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub action_value: String,
}

/// 路由 match 字段：单个字符串或字符串列表
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RouteMatch {
    Single(String),
    List(Vec<String>),
}

impl RouteMatch {
    /// 归一化为列表；单个字符串按 `,` 切分
    pub fn normalize(&self) -> Vec<String> {
        match self {
            RouteMatch::Single(s) => s.split(',').map(|p| p.to_string()).collect(),
            RouteMatch::List(items) => items.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BaseConfig {
    #[serde(default)]
    pub push_interval: Option<IntervalValue>,
    #[serde(default)]
    pub pull_interval: Option<IntervalValue>,
}

/// 间隔字段：数字或数字字符串，单位秒
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IntervalValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl IntervalValue {
    pub fn as_duration(&self) -> Duration {
        let secs = match self {
            IntervalValue::Int(v) => *v,
            IntervalValue::Float(v) => *v as i64,
            IntervalValue::Str(s) => s.trim().parse().unwrap_or(DEFAULT_INTERVAL_SECS),
        };
        if secs <= 0 {
            return Duration::from_secs(DEFAULT_INTERVAL_SECS as u64);
        }
        Duration::from_secs(secs as u64)
    }
}

const DEFAULT_INTERVAL_SECS: i64 = 60;

fn interval_or_default(v: &Option<IntervalValue>) -> Duration {
    v.as_ref()
        .map(|i| i.as_duration())
        .unwrap_or(Duration::from_secs(DEFAULT_INTERVAL_SECS as u64))
}

/// vmess / vless 节点参数
#[derive(Debug, Clone, Deserialize)]
pub struct VNode {
    #[serde(flatten)]
    pub common: CommonNode,
    #[serde(default)]
    pub tls: i32,
    #[serde(default)]
    pub tls_settings: Option<TlsSettings>,
    #[serde(default, rename = "tlsSettings")]
    pub tls_settings_back: Option<TlsSettings>,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub network_settings: Option<serde_json::Value>,
    #[serde(default, rename = "networkSettings")]
    pub network_settings_back: Option<serde_json::Value>,
    #[serde(default)]
    pub encryption: String,
    #[serde(default)]
    pub encryption_settings: Option<EncSettings>,
    /// 仅 vless
    #[serde(default)]
    pub flow: String,
}

impl VNode {
    /// 历史别名回填：规范名缺失时取 `networkSettings`/`tlsSettings`
    fn reconcile_aliases(&mut self) {
        if self.network_settings.is_none() {
            self.network_settings = self.network_settings_back.take();
        }
        self.network_settings_back = None;
        if self.tls_settings.is_none() {
            self.tls_settings = self.tls_settings_back.take();
        }
        self.tls_settings_back = None;
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub server_port: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub xver: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncSettings {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub ticket: String,
    #[serde(default)]
    pub server_padding: String,
    #[serde(default)]
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowsocksNode {
    #[serde(flatten)]
    pub common: CommonNode,
    #[serde(default)]
    pub cipher: String,
    #[serde(default)]
    pub server_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrojanNode {
    #[serde(flatten)]
    pub common: CommonNode,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub network_settings: Option<serde_json::Value>,
    #[serde(default, rename = "networkSettings")]
    pub network_settings_back: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HysteriaNode {
    #[serde(flatten)]
    pub common: CommonNode,
    #[serde(default)]
    pub up_mbps: i32,
    #[serde(default)]
    pub down_mbps: i32,
    #[serde(default)]
    pub obfs: String,
}

/// 解析后的阻断规则
#[derive(Debug, Clone, Default)]
pub struct Rules {
    pub regexp: Vec<String>,
    pub protocol: Vec<String>,
}

/// DNS 路由产物：main 块为原始 JSON，其余按路由序号成映射
#[derive(Debug, Clone, Default)]
pub struct RawDns {
    pub map: HashMap<String, DnsEntry>,
    pub json: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnsEntry {
    pub address: String,
    pub domains: Vec<String>,
}

impl NodeInfo {
    /// 从 config 响应体构建节点快照
    pub fn parse(body: &[u8], node_id: i32, node_type: &str) -> Result<NodeInfo> {
        let (common, payload, security) = match node_type {
            "vmess" | "vless" => {
                let mut v: VNode = serde_json::from_slice(body)
                    .map_err(|e| anyhow::anyhow!("decode {} params error: {}", node_type, e))?;
                v.reconcile_aliases();
                let security = Security::from(v.tls);
                (v.common.clone(), NodePayload::V(v), security)
            }
            "shadowsocks" => {
                let ss: ShadowsocksNode = serde_json::from_slice(body)
                    .map_err(|e| anyhow::anyhow!("decode shadowsocks params error: {}", e))?;
                (ss.common.clone(), NodePayload::Shadowsocks(ss), Security::None)
            }
            "trojan" => {
                let mut t: TrojanNode = serde_json::from_slice(body)
                    .map_err(|e| anyhow::anyhow!("decode trojan params error: {}", e))?;
                if t.network_settings.is_none() {
                    t.network_settings = t.network_settings_back.take();
                }
                t.network_settings_back = None;
                (t.common.clone(), NodePayload::Trojan(t), Security::Tls)
            }
            "hysteria" | "hysteria2" => {
                let h: HysteriaNode = serde_json::from_slice(body)
                    .map_err(|e| anyhow::anyhow!("decode hysteria params error: {}", e))?;
                (h.common.clone(), NodePayload::Hysteria(h), Security::Tls)
            }
            "tuic" | "anytls" => {
                let c: CommonNode = serde_json::from_slice(body)
                    .map_err(|e| anyhow::anyhow!("decode {} params error: {}", node_type, e))?;
                (c, NodePayload::Common, Security::Tls)
            }
            other => anyhow::bail!("unsupported node type: {}", other),
        };

        let (rules, raw_dns) = parse_routes(&common.routes);
        let (push_interval, pull_interval) = match &common.base_config {
            Some(bc) => (
                interval_or_default(&bc.push_interval),
                interval_or_default(&bc.pull_interval),
            ),
            None => (
                Duration::from_secs(DEFAULT_INTERVAL_SECS as u64),
                Duration::from_secs(DEFAULT_INTERVAL_SECS as u64),
            ),
        };

        Ok(NodeInfo {
            id: node_id,
            node_type: node_type.to_string(),
            security,
            push_interval,
            pull_interval,
            raw_dns,
            rules,
            common,
            payload,
        })
    }

    /// hysteria2 端口跳跃段，未声明时为 None
    pub fn port_hopping(&self) -> Option<(u16, u16)> {
        self.common.server_port.range
    }
}

/// 把路由表拆成阻断规则与 DNS 配置
fn parse_routes(routes: &[Route]) -> (Rules, RawDns) {
    let mut rules = Rules::default();
    let mut dns = RawDns::default();
    for (index, route) in routes.iter().enumerate() {
        let matches = route.matches.normalize();
        match route.action.as_str() {
            "block" => {
                for item in &matches {
                    if let Some(proto) = item.strip_prefix("protocol:") {
                        rules.protocol.push(proto.to_string());
                    } else {
                        rules
                            .regexp
                            .push(item.strip_prefix("regexp:").unwrap_or(item).to_string());
                    }
                }
            }
            "dns" => {
                if matches.first().map(|m| m.as_str()) == Some("main") {
                    dns.json = matches[1..].concat().into_bytes();
                } else {
                    dns.map.insert(
                        index.to_string(),
                        DnsEntry {
                            address: route.action_value.clone(),
                            domains: matches,
                        },
                    );
                }
            }
            _ => {}
        }
    }
    (rules, dns)
}

/// 面板用户记录。conn_limit 仅解码不使用。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UserInfo {
    pub id: i32,
    pub uuid: String,
    #[serde(default)]
    pub speed_limit: i32,
    #[serde(default)]
    pub device_limit: i32,
    #[serde(default)]
    pub conn_limit: i32,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserListBody {
    #[serde(default)]
    pub users: Vec<UserInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AliveMapBody {
    #[serde(default)]
    pub alive: HashMap<i32, i32>,
}

/// 在线设备：一个 uid 在一个上报窗口内观察到的一个来源 IP
#[derive(Debug, Clone, PartialEq)]
pub struct OnlineUser {
    pub uid: i32,
    pub ip: String,
}

/// 上报给面板的单用户流量
#[derive(Debug, Clone, PartialEq)]
pub struct UserTraffic {
    pub uid: i32,
    pub upload: i64,
    pub download: i64,
}
