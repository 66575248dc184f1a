//! 进程内核心（vmess / vless / trojan / shadowsocks）
//!
//! 入站协议框架本身是外部协作方：这里按节点构建一次入站配置、
//! 维护 uuid→uid 映射与协议用户注册、提供准入/记账钩子，以及
//! 流量切片的取值-清零与垃圾回收。

pub mod hook;
pub mod users;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::common::Error;
use crate::config::Options;
use crate::panel::{NodeInfo, RawDns, Security, UserInfo, UserTraffic};

use super::{AddUsersParams, Core};
use hook::HookServer;
use users::{build_users, ProtocolUser};

/// 按节点构建一次的入站配置，交给底层引擎
#[derive(Debug, Clone)]
pub struct InboundSettings {
    pub tag: String,
    pub listen: SocketAddr,
    pub protocol: String,
    pub security: Security,
    pub network: String,
    pub network_settings: Option<serde_json::Value>,
    pub cipher: String,
    pub server_key: String,
    pub dns: RawDns,
}

impl InboundSettings {
    fn build(tag: &str, info: &NodeInfo, options: &Options) -> Result<Self> {
        let listen_ip: IpAddr = options
            .listen_ip
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let (network, network_settings, cipher, server_key) = match &info.payload {
            crate::panel::NodePayload::V(v) => {
                (v.network.clone(), v.network_settings.clone(), String::new(), String::new())
            }
            crate::panel::NodePayload::Trojan(t) => {
                (t.network.clone(), t.network_settings.clone(), String::new(), String::new())
            }
            crate::panel::NodePayload::Shadowsocks(ss) => {
                (String::new(), None, ss.cipher.clone(), ss.server_key.clone())
            }
            _ => anyhow::bail!("native core does not support node type {}", info.node_type),
        };
        Ok(Self {
            tag: tag.to_string(),
            listen: SocketAddr::new(listen_ip, info.common.server_port.port),
            protocol: info.node_type.clone(),
            security: info.security,
            network,
            network_settings,
            cipher,
            server_key,
            dns: info.raw_dns.clone(),
        })
    }
}

/// 底层入站引擎的窄接口。引擎自带锁，调用方不跨它持有自己的锁。
#[async_trait]
pub trait InboundDriver: Send + Sync {
    async fn add_inbound(&self, settings: InboundSettings) -> Result<()>;
    async fn remove_inbound(&self, tag: &str) -> Result<()>;
    async fn add_user(&self, tag: &str, user: ProtocolUser) -> Result<()>;
    async fn remove_user(&self, tag: &str, key: &str) -> Result<()>;
}

/// 纯内存的入站注册表，同时是测试替身与引擎接入的参考实现
#[derive(Default)]
pub struct MemoryDriver {
    inbounds: RwLock<HashMap<String, InboundSettings>>,
    users: RwLock<HashMap<String, HashMap<String, ProtocolUser>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_inbound(&self, tag: &str) -> bool {
        self.inbounds.read().expect("driver lock").contains_key(tag)
    }

    pub fn user_count(&self, tag: &str) -> usize {
        self.users
            .read()
            .expect("driver lock")
            .get(tag)
            .map_or(0, |m| m.len())
    }
}

#[async_trait]
impl InboundDriver for MemoryDriver {
    async fn add_inbound(&self, settings: InboundSettings) -> Result<()> {
        self.users
            .write()
            .expect("driver lock")
            .entry(settings.tag.clone())
            .or_default();
        self.inbounds
            .write()
            .expect("driver lock")
            .insert(settings.tag.clone(), settings);
        Ok(())
    }

    async fn remove_inbound(&self, tag: &str) -> Result<()> {
        self.inbounds.write().expect("driver lock").remove(tag);
        self.users.write().expect("driver lock").remove(tag);
        Ok(())
    }

    async fn add_user(&self, tag: &str, user: ProtocolUser) -> Result<()> {
        let mut users = self.users.write().expect("driver lock");
        let Some(registry) = users.get_mut(tag) else {
            return Err(Error::NodeNotFound(tag.to_string()).into());
        };
        registry.insert(user.key.clone(), user);
        Ok(())
    }

    async fn remove_user(&self, tag: &str, key: &str) -> Result<()> {
        if let Some(registry) = self.users.write().expect("driver lock").get_mut(tag) {
            registry.remove(key);
        }
        Ok(())
    }
}

pub struct NativeCore {
    driver: Arc<dyn InboundDriver>,
    hook: Arc<HookServer>,
    inbounds: RwLock<HashMap<String, InboundSettings>>,
    /// tag|uuid → uid
    uid_map: RwLock<HashMap<String, i32>>,
    /// tag → 上报门槛（字节）
    report_min: RwLock<HashMap<String, i64>>,
}

impl NativeCore {
    pub fn new(driver: Arc<dyn InboundDriver>) -> Self {
        Self {
            driver,
            hook: Arc::new(HookServer::new()),
            inbounds: RwLock::new(HashMap::new()),
            uid_map: RwLock::new(HashMap::new()),
            report_min: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_memory_driver() -> Self {
        Self::new(Arc::new(MemoryDriver::new()))
    }

    pub fn hook(&self) -> Arc<HookServer> {
        self.hook.clone()
    }
}

#[async_trait]
impl Core for NativeCore {
    async fn start(&self) -> Result<()> {
        info!("native core started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let tags: Vec<String> = self.inbounds.read().expect("inbound lock").keys().cloned().collect();
        for tag in tags {
            self.del_node(&tag).await?;
        }
        info!("native core closed");
        Ok(())
    }

    async fn add_node(&self, tag: &str, info: &NodeInfo, options: &Options) -> Result<()> {
        let settings = InboundSettings::build(tag, info, options)?;
        {
            let mut inbounds = self.inbounds.write().expect("inbound lock");
            if inbounds.contains_key(tag) {
                return Err(Error::NodeExists(tag.to_string()).into());
            }
            inbounds.insert(tag.to_string(), settings.clone());
        }
        self.report_min
            .write()
            .expect("report min lock")
            .insert(tag.to_string(), options.report_min_bytes);
        self.driver.add_inbound(settings).await?;
        info!(tag = tag, node_type = info.node_type.as_str(), "inbound added");
        Ok(())
    }

    async fn del_node(&self, tag: &str) -> Result<()> {
        self.inbounds.write().expect("inbound lock").remove(tag);
        self.report_min.write().expect("report min lock").remove(tag);

        let prefix = format!("{}|", tag);
        let removed: Vec<String> = {
            let mut uid_map = self.uid_map.write().expect("uid lock");
            let keys: Vec<String> = uid_map.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
            for key in &keys {
                uid_map.remove(key);
            }
            keys
        };
        for key in &removed {
            self.driver.remove_user(tag, key).await?;
        }
        self.hook.remove_tag(tag);
        self.driver.remove_inbound(tag).await?;
        info!(tag = tag, users = removed.len(), "inbound removed");
        Ok(())
    }

    async fn add_users(&self, params: AddUsersParams<'_>) -> Result<usize> {
        if !self.inbounds.read().expect("inbound lock").contains_key(params.tag) {
            return Err(Error::NodeNotFound(params.tag.to_string()).into());
        }

        // 锁外构建协议用户（CPU 密集）
        let built = build_users(params.tag, params.users, params.node)?;

        // 重复 UUID 整批拒绝，不动全局状态
        {
            let uid_map = self.uid_map.read().expect("uid lock");
            if let Some(dup) = built.iter().find(|u| uid_map.contains_key(&u.key)) {
                return Err(Error::UserExists(dup.uuid.clone()).into());
            }
        }

        // 短写锁更新映射，注册交给引擎自己的锁
        {
            let mut uid_map = self.uid_map.write().expect("uid lock");
            for user in &built {
                uid_map.insert(user.key.clone(), user.uid);
            }
        }
        let added = built.len();
        for user in built {
            self.driver.add_user(params.tag, user).await?;
        }
        debug!(tag = params.tag, added = added, "users registered");
        Ok(added)
    }

    async fn del_users(&self, users: &[UserInfo], tag: &str, _info: &NodeInfo) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = users
            .iter()
            .map(|u| crate::common::user_tag(tag, &u.uuid))
            .collect();
        for key in &keys {
            self.driver.remove_user(tag, key).await?;
        }
        {
            let mut uid_map = self.uid_map.write().expect("uid lock");
            for key in &keys {
                uid_map.remove(key);
            }
        }
        if let Some(counter) = self.hook.counter_of(tag) {
            for key in &keys {
                counter.delete(key);
            }
        }
        for key in &keys {
            self.hook.close_connections(key);
        }
        debug!(tag = tag, deleted = keys.len(), "users removed");
        Ok(())
    }

    async fn user_traffic_slice(&self, tag: &str, reset: bool) -> Vec<UserTraffic> {
        let Some(counter) = self.hook.counter_of(tag) else {
            return Vec::new();
        };
        let min = self
            .report_min
            .read()
            .expect("report min lock")
            .get(tag)
            .copied()
            .unwrap_or(0);

        let mut slice = Vec::new();
        for (key, storage) in counter.entries() {
            let (up, down) = if reset { storage.take() } else { storage.load() };
            if up + down <= min {
                if reset {
                    // 低于门槛的流量退回去继续积累
                    storage.up.fetch_add(up, std::sync::atomic::Ordering::AcqRel);
                    storage.down.fetch_add(down, std::sync::atomic::Ordering::AcqRel);
                }
                continue;
            }
            match self.uid_map.read().expect("uid lock").get(&key) {
                Some(&uid) => slice.push(UserTraffic { uid, upload: up, download: down }),
                None => {
                    // 用户已不在注册表，计数器条目跟着回收
                    counter.delete(&key);
                }
            }
        }
        slice
    }

    fn protocols(&self) -> Vec<&'static str> {
        vec!["vmess", "vless", "trojan", "shadowsocks"]
    }

    fn core_type(&self) -> &'static str {
        "native"
    }
}
