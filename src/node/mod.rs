//! 节点监督器
//!
//! 从 N 份节点配置建 N 个控制器。单个节点起不来只是跳过，
//! 全军覆没才把错误交还调用方。

pub mod controller;
pub mod task;
pub mod user;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::cert::CertService;
use crate::config::NodeConfig;
use crate::core::Core;
use crate::panel::PanelClient;

pub use controller::Controller;
pub use user::compare_user_list;

#[derive(Default)]
pub struct Node {
    controllers: Vec<Arc<Controller>>,
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(
        &mut self,
        nodes: &[NodeConfig],
        core: Arc<dyn Core>,
        cert: Arc<CertService>,
    ) -> Result<()> {
        let mut success = 0usize;
        let mut failed = 0usize;

        for node in nodes {
            let api = match PanelClient::new(&node.api) {
                Ok(api) => Arc::new(api),
                Err(e) => {
                    error!(node_id = node.api.node_id, error = %e, "failed to create panel client, skipping node");
                    failed += 1;
                    continue;
                }
            };

            let controller = Controller::new(core.clone(), api, node.options.clone(), cert.clone());
            if let Err(e) = controller.start().await {
                error!(
                    api_host = node.api.host.as_str(),
                    node_id = node.api.node_id,
                    error = %e,
                    "failed to start node controller, skipping node"
                );
                failed += 1;
                continue;
            }

            info!(node_id = node.api.node_id, tag = controller.tag().as_str(), "node started");
            self.controllers.push(controller);
            success += 1;
        }

        info!(success = success, failed = failed, total = nodes.len(), "node startup complete");

        if success == 0 && !nodes.is_empty() {
            anyhow::bail!("all {} nodes failed to start", failed);
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        for controller in self.controllers.drain(..) {
            if let Err(e) = controller.close().await {
                error!(error = %e, "failed to close node controller");
            }
        }
    }

    pub fn controllers(&self) -> &[Arc<Controller>] {
        &self.controllers
    }
}
