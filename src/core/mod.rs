//! 核心抽象
//!
//! 控制器通过统一契约驱动异构后端：进程内引擎（vmess/vless/
//! trojan/shadowsocks）与 hysteria2 子进程。`AddNode` 是 `AddUsers`
//! 的前置；`DelNode` 幂等清掉该 tag 的用户、计数器与限速桶。

pub mod hy2;
pub mod native;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::common::Error;
use crate::config::{CoreConfig, Options};
use crate::panel::{NodeInfo, UserInfo, UserTraffic};

/// 批量加用户的参数
pub struct AddUsersParams<'a> {
    pub tag: &'a str,
    pub users: &'a [UserInfo],
    pub node: &'a NodeInfo,
}

#[async_trait]
pub trait Core: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn add_node(&self, tag: &str, info: &NodeInfo, options: &Options) -> Result<()>;
    async fn del_node(&self, tag: &str) -> Result<()>;
    /// 返回实际加入的用户数。重复 UUID 必须干净失败，不动全局状态。
    async fn add_users(&self, params: AddUsersParams<'_>) -> Result<usize>;
    async fn del_users(&self, users: &[UserInfo], tag: &str, info: &NodeInfo) -> Result<()>;
    /// `reset` 为真时取值与清零不可分割，字节不会既上报又保留
    async fn user_traffic_slice(&self, tag: &str, reset: bool) -> Vec<UserTraffic>;
    fn protocols(&self) -> Vec<&'static str>;
    fn core_type(&self) -> &'static str;
}

/// 按配置实例化核心
pub fn build_cores(configs: &[CoreConfig]) -> Result<Vec<Arc<dyn Core>>> {
    let mut cores: Vec<Arc<dyn Core>> = Vec::with_capacity(configs.len());
    for config in configs {
        match config.core_type.as_str() {
            "native" => cores.push(Arc::new(native::NativeCore::with_memory_driver())),
            "hysteria2" => cores.push(Arc::new(hy2::Hy2Core::new(config.hysteria2.clone()))),
            other => anyhow::bail!("unsupported core type: {}", other),
        }
    }
    Ok(cores)
}

/// 多核心选择器：按节点协议把操作派发到支持它的核心。
/// 新核心只需新增实现，调用点不变。
pub struct Selector {
    cores: Vec<Arc<dyn Core>>,
    /// tag → 承接该节点的核心
    assignments: RwLock<HashMap<String, Arc<dyn Core>>>,
}

impl Selector {
    pub fn new(cores: Vec<Arc<dyn Core>>) -> Self {
        Self {
            cores,
            assignments: RwLock::new(HashMap::new()),
        }
    }

    fn core_for_protocol(&self, protocol: &str) -> Option<Arc<dyn Core>> {
        self.cores
            .iter()
            .find(|c| c.protocols().contains(&protocol))
            .cloned()
    }

    fn assigned(&self, tag: &str) -> Result<Arc<dyn Core>> {
        self.assignments
            .read()
            .expect("assignment lock")
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(tag.to_string()).into())
    }
}

#[async_trait]
impl Core for Selector {
    async fn start(&self) -> Result<()> {
        for core in &self.cores {
            core.start().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for core in &self.cores {
            if let Err(e) = core.close().await {
                warn!(core = core.core_type(), error = %e, "core close failed");
            }
        }
        self.assignments.write().expect("assignment lock").clear();
        Ok(())
    }

    async fn add_node(&self, tag: &str, info: &NodeInfo, options: &Options) -> Result<()> {
        let core = self
            .core_for_protocol(&info.node_type)
            .ok_or_else(|| Error::Unsupported(format!("no core supports {}", info.node_type)))?;
        core.add_node(tag, info, options).await?;
        self.assignments
            .write()
            .expect("assignment lock")
            .insert(tag.to_string(), core);
        Ok(())
    }

    async fn del_node(&self, tag: &str) -> Result<()> {
        let core = self.assignments.write().expect("assignment lock").remove(tag);
        match core {
            Some(core) => core.del_node(tag).await,
            None => Ok(()),
        }
    }

    async fn add_users(&self, params: AddUsersParams<'_>) -> Result<usize> {
        self.assigned(params.tag)?.add_users(params).await
    }

    async fn del_users(&self, users: &[UserInfo], tag: &str, info: &NodeInfo) -> Result<()> {
        self.assigned(tag)?.del_users(users, tag, info).await
    }

    async fn user_traffic_slice(&self, tag: &str, reset: bool) -> Vec<UserTraffic> {
        match self.assigned(tag) {
            Ok(core) => core.user_traffic_slice(tag, reset).await,
            Err(_) => Vec::new(),
        }
    }

    fn protocols(&self) -> Vec<&'static str> {
        self.cores.iter().flat_map(|c| c.protocols()).collect()
    }

    fn core_type(&self) -> &'static str {
        "selector"
    }
}
