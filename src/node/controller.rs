//! 单节点控制器
//!
//! 持有一组 `(tag, PanelClient, Core, Limiter)`，启动时拉全量
//! 配置与用户，之后交给周期任务在线调整。只有启动失败是致命的；
//! 任务里的错误一律记日志等下个周期。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use crate::cert::CertService;
use crate::config::Options;
use crate::core::{AddUsersParams, Core};
use crate::limiter::{self, Limiter};
use crate::panel::{NodeInfo, PanelClient, Security, UserInfo};

use super::task::TaskSet;

/// 批量导入的批大小，压住内存峰值同时便于进度日志
pub(crate) const USER_IMPORT_BATCH: usize = 2000;

pub struct Controller {
    pub(crate) core: Arc<dyn Core>,
    pub(crate) api: Arc<PanelClient>,
    pub(crate) options: Options,
    pub(crate) cert: Arc<CertService>,
    pub(crate) tag: RwLock<String>,
    pub(crate) limiter: RwLock<Option<Arc<Limiter>>>,
    pub(crate) info: RwLock<Option<Arc<NodeInfo>>>,
    pub(crate) user_list: Mutex<Vec<UserInfo>>,
    /// uuid → 本窗口字节数；动态限速未启用时为 None
    pub(crate) traffic: Mutex<Option<HashMap<String, i64>>>,
    pub(crate) tasks: tokio::sync::Mutex<TaskSet>,
}

impl Controller {
    pub fn new(
        core: Arc<dyn Core>,
        api: Arc<PanelClient>,
        options: Options,
        cert: Arc<CertService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            api,
            options,
            cert,
            tag: RwLock::new(String::new()),
            limiter: RwLock::new(None),
            info: RwLock::new(None),
            user_list: Mutex::new(Vec::new()),
            traffic: Mutex::new(None),
            tasks: tokio::sync::Mutex::new(TaskSet::default()),
        })
    }

    pub fn tag(&self) -> String {
        self.tag.read().expect("tag lock").clone()
    }

    pub(crate) fn limiter(&self) -> Option<Arc<Limiter>> {
        self.limiter.read().expect("limiter lock").clone()
    }

    pub(crate) fn node_info(&self) -> Option<Arc<NodeInfo>> {
        self.info.read().expect("info lock").clone()
    }

    pub(crate) fn build_node_tag(&self, node: &NodeInfo) -> String {
        format!("[{}]-{}:{}", self.api.api_host(), node.node_type, node.id)
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let node = self
            .api
            .get_node_info()
            .await
            .context("get node info")?
            .context("panel returned no node info on first fetch")?;
        let users = self
            .api
            .get_user_list()
            .await
            .context("get user list")?
            .unwrap_or_default();
        let alive = self.api.get_user_alive().await;

        let tag = if self.options.name.is_empty() {
            self.build_node_tag(&node)
        } else {
            self.options.name.clone()
        };
        *self.tag.write().expect("tag lock") = tag.clone();

        let limiter = limiter::add_limiter(&tag, &self.options.limit, &users, alive);
        limiter.update_rule(&node.rules);
        *self.limiter.write().expect("limiter lock") = Some(limiter);

        if node.security == Security::Tls {
            self.cert.ensure(&self.options.cert).await.context("request cert")?;
        }

        self.core
            .add_node(&tag, &node, &self.options)
            .await
            .context("add node")?;

        if users.len() > USER_IMPORT_BATCH {
            info!(
                tag = tag.as_str(),
                user_count = users.len(),
                batch_size = USER_IMPORT_BATCH,
                "large user list detected, importing in batches"
            );
        } else {
            info!(tag = tag.as_str(), user_count = users.len(), "importing users from panel");
        }
        let start = Instant::now();
        let added = self.add_users_in_batches(&tag, &node, &users).await?;
        info!(
            tag = tag.as_str(),
            added = added,
            duration_ms = start.elapsed().as_millis() as u64,
            "users imported"
        );

        *self.user_list.lock().expect("user list lock") = users;
        if self.options.limit.enable_dynamic_speed_limit {
            *self.traffic.lock().expect("traffic lock") = Some(HashMap::new());
        }
        let node = Arc::new(node);
        *self.info.write().expect("info lock") = Some(node.clone());
        self.start_tasks(&node).await;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let tag = self.tag();
        limiter::delete_limiter(&tag);
        self.tasks.lock().await.close_all();
        self.core.del_node(&tag).await.context("del node")?;
        Ok(())
    }

    pub(crate) async fn add_users_in_batches(
        &self,
        tag: &str,
        node: &NodeInfo,
        users: &[UserInfo],
    ) -> Result<usize> {
        if users.is_empty() {
            return Ok(0);
        }
        let mut total_added = 0;
        for chunk in users.chunks(USER_IMPORT_BATCH) {
            total_added += self
                .core
                .add_users(AddUsersParams {
                    tag,
                    users: chunk,
                    node,
                })
                .await?;
            if users.len() > USER_IMPORT_BATCH {
                info!(
                    tag = tag,
                    progress = format!("{}/{}", total_added, users.len()),
                    "user import progress"
                );
            }
        }
        Ok(total_added)
    }
}
