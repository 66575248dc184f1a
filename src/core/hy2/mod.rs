//! Hysteria2 核心（子进程模式）
//!
//! 每个节点 tag 一个受管子进程。用户变更重写 YAML 并重启子进程；
//! 流量从子进程的 trafficStats 接口带 `clear=1` 刮取。声明了端口
//! 段的节点装 NAT 重定向规则，关停时按 comment 精确拆除。

pub mod config;
pub mod nat;
pub mod process;
pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::common::Error;
use crate::config::{Hy2Config, Options};
use crate::panel::{NodeInfo, UserInfo, UserTraffic};

use super::{AddUsersParams, Core};
use config::ConfigGenerator;
use nat::{NatManager, PortHopping};
use process::ProcessHandle;
use stats::StatsClient;

struct Hy2Node {
    process: Arc<ProcessHandle>,
    stats: StatsClient,
    users: Vec<UserInfo>,
    /// uuid → uid
    user_map: HashMap<String, i32>,
    port_hopping: Option<PortHopping>,
}

pub struct Hy2Core {
    settings: Hy2Config,
    generator: ConfigGenerator,
    nat: NatManager,
    nodes: Mutex<HashMap<String, Hy2Node>>,
    nat_available: std::sync::atomic::AtomicBool,
}

impl Hy2Core {
    pub fn new(settings: Hy2Config) -> Self {
        let generator = ConfigGenerator::new(settings.config_dir.clone(), settings.stats_secret.clone());
        Self {
            settings,
            generator,
            nat: NatManager::new(),
            nodes: Mutex::new(HashMap::new()),
            nat_available: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn nat_ok(&self) -> bool {
        self.nat_available.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl Core for Hy2Core {
    async fn start(&self) -> Result<()> {
        let capable = self.nat.has_capability().await;
        self.nat_available
            .store(capable, std::sync::atomic::Ordering::Relaxed);
        if capable {
            // 上次运行残留的规则先清掉
            self.nat.cleanup_all().await;
        } else {
            warn!("iptables nat not available, port hopping disabled");
        }
        if !std::path::Path::new(&self.settings.binary_path).exists() {
            warn!(
                binary = self.settings.binary_path.as_str(),
                "hysteria2 binary not found, nodes will fail to start until installed"
            );
        }
        info!("hysteria2 core started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let drained: Vec<(String, Hy2Node)> = self.nodes.lock().await.drain().collect();
        for (tag, node) in drained {
            if let Err(e) = node.process.stop().await {
                warn!(tag = tag.as_str(), error = %e, "error stopping process");
            }
        }
        if self.nat_ok() {
            self.nat.cleanup_all().await;
        }
        info!("hysteria2 core closed");
        Ok(())
    }

    async fn add_node(&self, tag: &str, info: &NodeInfo, options: &Options) -> Result<()> {
        let port_hopping = info.port_hopping().map(|(start, end)| PortHopping {
            start,
            end,
            listen: info.common.server_port.port,
        });
        {
            let mut nodes = self.nodes.lock().await;
            if nodes.contains_key(tag) {
                return Err(Error::NodeExists(tag.to_string()).into());
            }

            // 初始配置先落盘（空用户表），等 AddUsers 再拉起子进程
            let config_path = self.generator.generate(tag, info, options, &[])?;
            let process = Arc::new(ProcessHandle::new(tag, &self.settings.binary_path, &config_path));
            let stats =
                StatsClient::new(config::stats_address(info.id), self.settings.stats_secret.clone());
            nodes.insert(
                tag.to_string(),
                Hy2Node {
                    process,
                    stats,
                    users: Vec::new(),
                    user_map: HashMap::new(),
                    port_hopping,
                },
            );
        }

        if let Some(hopping) = &port_hopping {
            if self.nat_ok() {
                if let Err(e) = self.nat.add_port_hopping(tag, hopping).await {
                    warn!(tag = tag, error = %e, "port hopping setup failed, continuing without it");
                }
            } else {
                warn!(tag = tag, "port hopping requested but nat unavailable");
            }
        }

        info!(
            tag = tag,
            port = info.common.server_port.port,
            "hysteria2 node added, waiting for users"
        );
        Ok(())
    }

    async fn del_node(&self, tag: &str) -> Result<()> {
        let node = self.nodes.lock().await.remove(tag);
        let Some(node) = node else {
            return Ok(());
        };
        if let Err(e) = node.process.stop().await {
            warn!(tag = tag, error = %e, "error stopping process");
        }
        if node.port_hopping.is_some() && self.nat_ok() {
            if let Err(e) = self.nat.remove_port_hopping(tag).await {
                warn!(tag = tag, error = %e, "error removing port hopping rules");
            }
        }
        if let Err(e) = self.generator.delete(tag) {
            warn!(tag = tag, error = %e, "error deleting config");
        }
        info!(tag = tag, "hysteria2 node removed");
        Ok(())
    }

    async fn add_users(&self, params: AddUsersParams<'_>) -> Result<usize> {
        // 节点表的锁不跨子进程操作持有
        let (process, users, added) = {
            let mut nodes = self.nodes.lock().await;
            let node = nodes
                .get_mut(params.tag)
                .ok_or_else(|| Error::NodeNotFound(params.tag.to_string()))?;

            // 重复 UUID 整批拒绝，不动节点状态
            if let Some(dup) = params.users.iter().find(|u| node.user_map.contains_key(&u.uuid)) {
                return Err(Error::UserExists(dup.uuid.clone()).into());
            }
            for user in params.users {
                node.users.push(user.clone());
                node.user_map.insert(user.uuid.clone(), user.id);
            }
            (node.process.clone(), node.users.clone(), params.users.len())
        };

        self.generator.update_users(params.tag, &users)?;

        // 有用户才值得拉起子进程；已在跑则重启让配置生效
        process.reap_if_exited().await;
        if process.is_running() {
            process.restart().await?;
        } else {
            process.start().await?;
        }

        debug!(tag = params.tag, added = added, total = users.len(), "hysteria2 users updated");
        Ok(added)
    }

    async fn del_users(&self, users: &[UserInfo], tag: &str, _info: &NodeInfo) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let (process, stats, remaining) = {
            let mut nodes = self.nodes.lock().await;
            let node = nodes
                .get_mut(tag)
                .ok_or_else(|| Error::NodeNotFound(tag.to_string()))?;
            let removed: std::collections::HashSet<&str> =
                users.iter().map(|u| u.uuid.as_str()).collect();
            for user in users {
                node.user_map.remove(&user.uuid);
            }
            node.users.retain(|u| !removed.contains(u.uuid.as_str()));
            (node.process.clone(), node.stats.clone(), node.users.clone())
        };

        // 被删的用户先踢下线，重启只是兜底
        if process.is_running() {
            for user in users {
                if let Err(e) = stats.kick(&user.uuid).await {
                    debug!(tag = tag, user = user.uuid.as_str(), error = %e, "kick failed");
                }
            }
        }

        self.generator.update_users(tag, &remaining)?;

        process.reap_if_exited().await;
        if process.is_running() {
            process.restart().await?;
        }

        debug!(tag = tag, deleted = users.len(), total = remaining.len(), "hysteria2 users removed");
        Ok(())
    }

    async fn user_traffic_slice(&self, tag: &str, reset: bool) -> Vec<UserTraffic> {
        let (process, stats, user_map) = {
            let nodes = self.nodes.lock().await;
            let Some(node) = nodes.get(tag) else {
                return Vec::new();
            };
            (node.process.clone(), node.stats.clone(), node.user_map.clone())
        };
        process.reap_if_exited().await;
        if !process.is_running() {
            return Vec::new();
        }
        match stats.get_traffic(reset).await {
            Ok(response) => stats::to_user_traffic(&response, &user_map),
            Err(e) => {
                debug!(tag = tag, error = %e, "failed to scrape traffic stats");
                Vec::new()
            }
        }
    }

    fn protocols(&self) -> Vec<&'static str> {
        vec!["hysteria2"]
    }

    fn core_type(&self) -> &'static str {
        "hysteria2"
    }
}
