//! 代理配置
//!
//! YAML 格式：`cores:` 声明可用核心，`nodes:` 声明面板节点。
//! 面板下发的节点参数不在这里，这里只有连接面板所需的凭据
//! 与本机侧的限制/证书选项。

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub cores: Vec<CoreConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.cores.is_empty() {
            anyhow::bail!("at least one core is required");
        }
        if self.nodes.is_empty() {
            anyhow::bail!("at least one node is required");
        }
        for core in &self.cores {
            match core.core_type.as_str() {
                "native" | "hysteria2" => {}
                other => anyhow::bail!("unsupported core type: {} (supported: native, hysteria2)", other),
            }
        }
        for node in &self.nodes {
            if node.api.host.is_empty() {
                anyhow::bail!("node {} missing api.host", node.api.node_id);
            }
            if node.api.token.is_empty() {
                anyhow::bail!("node {} missing api.token", node.api.node_id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 核心声明。native 为进程内引擎，hysteria2 为子进程模式。
#[derive(Debug, Deserialize)]
pub struct CoreConfig {
    #[serde(rename = "type")]
    pub core_type: String,
    #[serde(default)]
    pub hysteria2: Hy2Config,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hy2Config {
    #[serde(default = "default_hy2_binary")]
    pub binary_path: String,
    #[serde(default = "default_hy2_config_dir")]
    pub config_dir: String,
    /// trafficStats 接口的 Bearer 凭据，空则不鉴权
    #[serde(default)]
    pub stats_secret: String,
}

impl Default for Hy2Config {
    fn default() -> Self {
        Self {
            binary_path: default_hy2_binary(),
            config_dir: default_hy2_config_dir(),
            stats_secret: String::new(),
        }
    }
}

fn default_hy2_binary() -> String {
    "/usr/local/bin/hysteria".to_string()
}

fn default_hy2_config_dir() -> String {
    "/etc/edgeward/hy2".to_string()
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub options: Options,
}

/// 面板接入参数
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub token: String,
    pub node_id: i32,
    /// 可为空，留空时从首次 config 响应自动探测
    #[serde(default)]
    pub node_type: String,
    /// 请求超时（秒），0 取默认 5 秒
    #[serde(default)]
    pub timeout: u64,
    /// 出口绑定的本地 IP
    #[serde(default)]
    pub send_ip: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Options {
    /// 入站 tag；留空时按 `[host]-type:id` 生成
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    #[serde(default)]
    pub cert: CertConfig,
    #[serde(default)]
    pub limit: LimitConfig,
    /// 在线设备上报的最小流量门槛（KB），低于此的用户不计入设备名单
    #[serde(default)]
    pub device_online_min_traffic: i64,
    /// 流量上报的最小字节数门槛
    #[serde(default)]
    pub report_min_bytes: i64,
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertConfig {
    /// none / file / self / http / dns / tls
    #[serde(default = "default_cert_mode")]
    pub cert_mode: String,
    #[serde(default)]
    pub cert_domain: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub email: String,
    /// DNS 供应商凭据，透传给 ACME 协作方
    #[serde(default)]
    pub dns_env: HashMap<String, String>,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            cert_mode: default_cert_mode(),
            cert_domain: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            email: String::new(),
            dns_env: HashMap::new(),
        }
    }
}

fn default_cert_mode() -> String {
    "none".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitConfig {
    /// 节点级速率上限（Mbps），0 不限
    #[serde(default)]
    pub speed_limit: i32,
    #[serde(default)]
    pub enable_dynamic_speed_limit: bool,
    #[serde(default)]
    pub dynamic_speed_limit: DynamicSpeedLimitConfig,
}

/// 动态限速：窗口内流量超过 traffic 字节的用户被压到 speed_limit，
/// expire_time 分钟后解除
#[derive(Debug, Clone, Deserialize)]
pub struct DynamicSpeedLimitConfig {
    /// 检查周期（秒）
    #[serde(default = "default_dynamic_periodic")]
    pub periodic: u64,
    /// 触发阈值（字节）
    #[serde(default)]
    pub traffic: i64,
    /// 压制后的速率（Mbps）
    #[serde(default)]
    pub speed_limit: i32,
    /// 压制时长（分钟）
    #[serde(default = "default_dynamic_expire")]
    pub expire_time: i64,
}

impl Default for DynamicSpeedLimitConfig {
    fn default() -> Self {
        Self {
            periodic: default_dynamic_periodic(),
            traffic: 0,
            speed_limit: 0,
            expire_time: default_dynamic_expire(),
        }
    }
}

fn default_dynamic_periodic() -> u64 {
    60
}

fn default_dynamic_expire() -> i64 {
    60
}

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(Path::new(path))?;
    let config: Config = serde_yml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// `generate config` 输出的样例
pub const SAMPLE_CONFIG: &str = r#"log:
  level: info

cores:
  - type: native
  - type: hysteria2
    hysteria2:
      binary_path: /usr/local/bin/hysteria
      config_dir: /etc/edgeward/hy2

nodes:
  - api:
      host: https://panel.example.com
      token: your-panel-token
      node_id: 1
      node_type: vmess
    options:
      limit:
        speed_limit: 0
        enable_dynamic_speed_limit: false
      device_online_min_traffic: 100
"#;
