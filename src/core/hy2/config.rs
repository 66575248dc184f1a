//! Hysteria2 子进程配置文件
//!
//! 每个节点一份 YAML：监听、可选 TLS、userpass 认证（uuid→uuid）、
//! 由节点 id 推导的本机 trafficStats 端口、direct 出站，以及拦掉
//! 内网段的默认 ACL。文件名由 tag 清洗而来。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::Options;
use crate::panel::{NodeInfo, UserInfo};

/// trafficStats 端口基数；实际端口 = 基数 + id % 1000
pub const STATS_PORT_BASE: u16 = 25590;

#[derive(Debug, Serialize, Deserialize)]
pub struct Hy2ServerConfig {
    pub listen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<Hy2TlsConfig>,
    pub auth: Hy2AuthConfig,
    #[serde(rename = "trafficStats", skip_serializing_if = "Option::is_none")]
    pub traffic_stats: Option<Hy2StatsConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub outbounds: Vec<Hy2Outbound>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl: Option<Hy2AclConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Hy2TlsConfig {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Hy2AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: String,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty", default)]
    pub userpass: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Hy2StatsConfig {
    pub listen: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Hy2Outbound {
    pub name: String,
    #[serde(rename = "type")]
    pub outbound_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct: Option<Hy2DirectConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Hy2DirectConfig {
    pub mode: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Hy2AclConfig {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub inline: Vec<String>,
}

/// 文件名清洗：路径分隔符与 URL 符号换成下划线并折叠
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.chars() {
        let mapped = match c {
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' => Some(c),
            '<' | '>' | '"' | '|' | '?' | '*' | '[' | ']' => None,
            _ => Some('_'),
        };
        match mapped {
            Some('_') => {
                if !last_underscore {
                    out.push('_');
                }
                last_underscore = true;
            }
            Some(c) => {
                out.push(c);
                last_underscore = false;
            }
            None => {}
        }
    }
    out.trim_matches('_').to_string()
}

/// 节点 id 对应的统计端口
pub fn stats_port(node_id: i32) -> u16 {
    STATS_PORT_BASE + (node_id.rem_euclid(1000)) as u16
}

/// 统计接口地址
pub fn stats_address(node_id: i32) -> String {
    format!("http://127.0.0.1:{}", stats_port(node_id))
}

pub struct ConfigGenerator {
    config_dir: PathBuf,
    stats_secret: String,
}

impl ConfigGenerator {
    pub fn new(config_dir: impl Into<PathBuf>, stats_secret: String) -> Self {
        Self {
            config_dir: config_dir.into(),
            stats_secret,
        }
    }

    pub fn config_path(&self, tag: &str) -> PathBuf {
        self.config_dir.join(format!("{}.yaml", sanitize_filename(tag)))
    }

    /// 生成节点配置文件，返回文件路径
    pub fn generate(
        &self,
        tag: &str,
        info: &NodeInfo,
        options: &Options,
        users: &[UserInfo],
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("create config dir {}", self.config_dir.display()))?;

        let mut config = Hy2ServerConfig {
            listen: format!(":{}", info.common.server_port.port),
            tls: None,
            auth: Hy2AuthConfig {
                auth_type: "userpass".to_string(),
                userpass: users.iter().map(|u| (u.uuid.clone(), u.uuid.clone())).collect(),
            },
            traffic_stats: Some(Hy2StatsConfig {
                listen: format!("127.0.0.1:{}", stats_port(info.id)),
                secret: self.stats_secret.clone(),
            }),
            outbounds: vec![Hy2Outbound {
                name: "direct".to_string(),
                outbound_type: "direct".to_string(),
                direct: Some(Hy2DirectConfig {
                    mode: "auto".to_string(),
                }),
            }],
            acl: Some(Hy2AclConfig {
                inline: default_acl(),
            }),
        };

        if !options.cert.cert_file.is_empty() {
            config.tls = Some(Hy2TlsConfig {
                cert: options.cert.cert_file.clone(),
                key: options.cert.key_file.clone(),
            });
        }

        let path = self.config_path(tag);
        let yaml = serde_yml::to_string(&config).context("marshal hysteria2 config")?;
        std::fs::write(&path, yaml).with_context(|| format!("write config {}", path.display()))?;
        Ok(path)
    }

    /// 只改用户表，其余字段原样保留
    pub fn update_users(&self, tag: &str, users: &[UserInfo]) -> Result<()> {
        let path = self.config_path(tag);
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("read config {}", path.display()))?;
        let mut config: Hy2ServerConfig =
            serde_yml::from_str(&content).context("parse hysteria2 config")?;

        config.auth.auth_type = "userpass".to_string();
        config.auth.userpass = users.iter().map(|u| (u.uuid.clone(), u.uuid.clone())).collect();

        let yaml = serde_yml::to_string(&config).context("marshal hysteria2 config")?;
        std::fs::write(&path, yaml).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    pub fn delete(&self, tag: &str) -> Result<()> {
        let path = self.config_path(tag);
        if Path::new(&path).exists() {
            std::fs::remove_file(&path).with_context(|| format!("remove config {}", path.display()))?;
        }
        Ok(())
    }
}

/// 默认 ACL：拦内网、环回与 IPv6 ULA/链路本地，其余直连
fn default_acl() -> Vec<String> {
    vec![
        "reject(geoip:private)".to_string(),
        "reject(127.0.0.0/8)".to_string(),
        "reject(10.0.0.0/8)".to_string(),
        "reject(172.16.0.0/12)".to_string(),
        "reject(192.168.0.0/16)".to_string(),
        "reject(fc00::/7)".to_string(),
        "reject(fe80::/10)".to_string(),
        "direct(all)".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i32, port: u16) -> NodeInfo {
        let body = format!(r#"{{"server_port": {}}}"#, port);
        NodeInfo::parse(body.as_bytes(), id, "hysteria2").unwrap()
    }

    fn user(id: i32, uuid: &str) -> UserInfo {
        UserInfo {
            id,
            uuid: uuid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(
            sanitize_filename("[https://panel.example.com]-vmess:1"),
            "https_panel.example.com-vmess_1"
        );
        assert_eq!(sanitize_filename("a//b"), "a_b");
        assert_eq!(sanitize_filename("___x___"), "x");
    }

    #[test]
    fn stats_port_is_deterministic() {
        assert_eq!(stats_port(0), 25590);
        assert_eq!(stats_port(7), 25597);
        assert_eq!(stats_port(1007), 25597);
        assert_eq!(stats_address(3), "http://127.0.0.1:25593");
    }

    #[test]
    fn generate_writes_expected_schema() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ConfigGenerator::new(dir.path(), "s3cret".to_string());
        let info = node(7, 443);
        let path = generator
            .generate("tag-a", &info, &Options::default(), &[user(1, "uuid-1"), user(2, "uuid-2")])
            .unwrap();

        let parsed: Hy2ServerConfig =
            serde_yml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.listen, ":443");
        assert_eq!(parsed.auth.auth_type, "userpass");
        assert_eq!(parsed.auth.userpass["uuid-1"], "uuid-1");
        assert_eq!(parsed.auth.userpass.len(), 2);
        let stats = parsed.traffic_stats.unwrap();
        assert_eq!(stats.listen, "127.0.0.1:25597");
        assert_eq!(stats.secret, "s3cret");
        assert_eq!(parsed.outbounds[0].name, "direct");
        assert!(parsed.acl.unwrap().inline.contains(&"reject(fc00::/7)".to_string()));
        // 无证书配置时不写 tls 块
        assert!(parsed.tls.is_none());
    }

    #[test]
    fn generate_includes_tls_when_cert_configured() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ConfigGenerator::new(dir.path(), String::new());
        let info = node(1, 443);
        let mut options = Options::default();
        options.cert.cert_file = "/etc/cert/fullchain.pem".to_string();
        options.cert.key_file = "/etc/cert/key.pem".to_string();
        let path = generator.generate("t", &info, &options, &[]).unwrap();

        let parsed: Hy2ServerConfig =
            serde_yml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let tls = parsed.tls.unwrap();
        assert_eq!(tls.cert, "/etc/cert/fullchain.pem");
        assert_eq!(tls.key, "/etc/cert/key.pem");
    }

    #[test]
    fn update_users_rewrites_only_auth() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ConfigGenerator::new(dir.path(), String::new());
        let info = node(1, 8443);
        generator
            .generate("t", &info, &Options::default(), &[user(1, "old")])
            .unwrap();

        generator.update_users("t", &[user(2, "new-a"), user(3, "new-b")]).unwrap();

        let parsed: Hy2ServerConfig =
            serde_yml::from_str(&std::fs::read_to_string(generator.config_path("t")).unwrap()).unwrap();
        assert_eq!(parsed.listen, ":8443");
        assert!(!parsed.auth.userpass.contains_key("old"));
        assert_eq!(parsed.auth.userpass.len(), 2);
    }

    #[test]
    fn delete_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ConfigGenerator::new(dir.path(), String::new());
        let info = node(1, 443);
        let path = generator.generate("t", &info, &Options::default(), &[]).unwrap();
        assert!(path.exists());
        generator.delete("t").unwrap();
        assert!(!path.exists());
        generator.delete("t").unwrap();
    }
}
