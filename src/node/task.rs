//! 周期任务
//!
//! 每个控制器跑四个循环：节点监控（pull_interval）、流量与在线
//! 设备上报（push_interval）、动态限速检查（可选）、证书续期
//! （24h，仅 ACME 模式）。任务体出错只记日志，从不向调度方传播，
//! 下个周期照常执行。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::limiter;
use crate::panel::{NodeInfo, Security, UserInfo};

use super::controller::Controller;
use super::user::compare_user_list;

/// 证书续期节奏
const CERT_RENEW_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// 一个周期循环的取消句柄
pub(crate) struct Periodic {
    cancel: CancellationToken,
}

impl Periodic {
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

/// 固定间隔跑 `f`，首次执行等一个完整间隔
pub(crate) fn spawn_periodic<F, Fut>(name: &'static str, every: Duration, f: F) -> Periodic
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + every;
        let mut ticker = tokio::time::interval_at(start, every);
        loop {
            tokio::select! {
                _ = ticker.tick() => f().await,
                _ = token.cancelled() => {
                    debug!(task = name, "periodic task stopped");
                    break;
                }
            }
        }
    });
    Periodic { cancel }
}

/// 控制器当前挂着的任务与生效间隔
#[derive(Default)]
pub(crate) struct TaskSet {
    periodics: Vec<Periodic>,
    pull: Duration,
    push: Duration,
}

impl TaskSet {
    pub(crate) fn close_all(&mut self) {
        for p in self.periodics.drain(..) {
            p.close();
        }
    }

    pub(crate) fn intervals(&self) -> (Duration, Duration) {
        (self.pull, self.push)
    }
}

impl Controller {
    /// 按节点下发的间隔（重新）挂起全部周期任务
    pub(crate) fn start_tasks<'a>(
        self: &'a Arc<Self>,
        node: &'a NodeInfo,
    ) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let mut set = self.tasks.lock().await;
        set.close_all();
        set.pull = node.pull_interval;
        set.push = node.push_interval;

        let tag = self.tag();
        info!(tag = tag.as_str(), "start monitor node status");
        let c = self.clone();
        set.periodics.push(spawn_periodic("node_monitor", node.pull_interval, move || {
            let c = c.clone();
            async move { c.monitor_once().await }
        }));

        info!(tag = tag.as_str(), "start report node status");
        let c = self.clone();
        set.periodics.push(spawn_periodic("user_report", node.push_interval, move || {
            let c = c.clone();
            async move { c.report_once().await }
        }));

        if node.security == Security::Tls && crate::cert::mode_requires_acme(&self.options.cert.cert_mode) {
            info!(tag = tag.as_str(), "start renew cert");
            let c = self.clone();
            set.periodics.push(spawn_periodic("cert_renew", CERT_RENEW_INTERVAL, move || {
                let c = c.clone();
                async move { c.renew_cert_once().await }
            }));
        }

        if self.options.limit.enable_dynamic_speed_limit {
            let period = Duration::from_secs(self.options.limit.dynamic_speed_limit.periodic.max(1));
            info!(
                tag = tag.as_str(),
                node_id = self.api.node_id(),
                period_secs = period.as_secs(),
                "start dynamic speed limit"
            );
            let c = self.clone();
            set.periodics.push(spawn_periodic("speed_checker", period, move || {
                let c = c.clone();
                async move { c.speed_check_once().await }
            }));
        }
        })
    }

    /// 节点监控一轮：拉 config/user/alive，节点变更整体重建，
    /// 否则按差异对账用户。
    pub async fn monitor_once(self: &Arc<Self>) {
        let round_start = Instant::now();
        let tag = self.tag();

        let t0 = Instant::now();
        let new_node = match self.api.get_node_info().await {
            Ok(n) => n,
            Err(e) => {
                warn!(tag = tag.as_str(), error = %e, "get node info failed, will retry next interval");
                return;
            }
        };
        let dur_config = t0.elapsed();

        let t1 = Instant::now();
        let new_users = match self.api.get_user_list().await {
            Ok(u) => u,
            Err(e) => {
                warn!(tag = tag.as_str(), error = %e, "get user list failed, will retry next interval");
                return;
            }
        };
        let dur_users = t1.elapsed();

        let t2 = Instant::now();
        let new_alive = self.api.get_user_alive().await;
        let dur_alive = t2.elapsed();

        debug!(
            tag = tag.as_str(),
            node_id = self.api.node_id(),
            node_type = self.api.node_type().as_str(),
            config_304 = new_node.is_none(),
            users_304 = new_users.is_none(),
            alive_keys = new_alive.len(),
            dur_config_ms = dur_config.as_millis() as u64,
            dur_users_ms = dur_users.as_millis() as u64,
            dur_alive_ms = dur_alive.as_millis() as u64,
            dur_total_ms = round_start.elapsed().as_millis() as u64,
            "node monitor round"
        );

        if let Some(node) = new_node {
            self.rebuild_node(node, new_users, new_alive).await;
            return;
        }

        // 节点未变：alive 照常刷新
        if let Some(limiter) = self.limiter() {
            limiter.set_alive(new_alive);
        }

        let Some(new_users) = new_users else {
            return;
        };
        if new_users.is_empty() {
            return;
        }
        self.reconcile_users(&tag, new_users).await;
    }

    /// 配置级变更：拆旧建新，同 UUID 的用户全量重挂
    async fn rebuild_node(
        self: &Arc<Self>,
        node: NodeInfo,
        new_users: Option<Vec<UserInfo>>,
        new_alive: HashMap<i32, i32>,
    ) {
        let old_tag = self.tag();
        info!(tag = old_tag.as_str(), "node changed, reload");

        if let Some(users) = new_users {
            *self.user_list.lock().expect("user list lock") = users;
        }
        // 动态限速积累窗口跟着节点重置
        *self.traffic.lock().expect("traffic lock") = if self.options.limit.enable_dynamic_speed_limit {
            Some(HashMap::new())
        } else {
            None
        };

        if let Err(e) = self.core.del_node(&old_tag).await {
            error!(tag = old_tag.as_str(), error = %e, "delete node failed, will retry next interval");
            return;
        }

        let new_tag = if self.options.name.is_empty() {
            self.build_node_tag(&node)
        } else {
            self.options.name.clone()
        };
        // 先按旧 tag 删除，绝不能删到新 tag
        if new_tag != old_tag {
            limiter::delete_limiter(&old_tag);
        }
        *self.tag.write().expect("tag lock") = new_tag.clone();

        let users = self.user_list.lock().expect("user list lock").clone();
        let limiter = limiter::add_limiter(&new_tag, &self.options.limit, &users, new_alive);
        limiter.update_rule(&node.rules);
        *self.limiter.write().expect("limiter lock") = Some(limiter);

        if node.security == Security::Tls {
            if let Err(e) = self.cert.ensure(&self.options.cert).await {
                error!(tag = new_tag.as_str(), error = %e, "request cert failed");
                return;
            }
        }

        if let Err(e) = self.core.add_node(&new_tag, &node, &self.options).await {
            error!(tag = new_tag.as_str(), error = %e, "add node failed, will retry next interval");
            return;
        }
        let start = Instant::now();
        match self.add_users_in_batches(&new_tag, &node, &users).await {
            Ok(added) => info!(
                tag = new_tag.as_str(),
                users = added,
                duration_ms = start.elapsed().as_millis() as u64,
                "users reloaded after node change"
            ),
            Err(e) => {
                error!(tag = new_tag.as_str(), error = %e, "add users failed");
                return;
            }
        }

        let node = Arc::new(node);
        *self.info.write().expect("info lock") = Some(node.clone());

        // 面板改了间隔就按新间隔重挂任务
        let (pull, push) = self.tasks.lock().await.intervals();
        if pull != node.pull_interval || push != node.push_interval {
            info!(
                tag = new_tag.as_str(),
                pull_secs = node.pull_interval.as_secs(),
                push_secs = node.push_interval.as_secs(),
                "task intervals updated"
            );
            self.start_tasks(&node).await;
        }
    }

    /// 用户对账：added/deleted 走核心，updated 走 limiter 热路径
    async fn reconcile_users(&self, tag: &str, new_users: Vec<UserInfo>) {
        let old_users = self.user_list.lock().expect("user list lock").clone();
        let (deleted, added, updated) = compare_user_list(&old_users, &new_users);

        let info_arc = self.node_info();
        let Some(node) = info_arc else {
            return;
        };

        if !deleted.is_empty() {
            if let Err(e) = self.core.del_users(&deleted, tag, &node).await {
                error!(tag = tag, error = %e, "delete users failed");
                return;
            }
        }
        if !added.is_empty() {
            if let Err(e) = self.add_users_in_batches(tag, &node, &added).await {
                error!(tag = tag, error = %e, "add users failed");
                return;
            }
        }
        if !added.is_empty() || !deleted.is_empty() {
            if let Some(limiter) = self.limiter() {
                limiter.update_user(tag, &added, &deleted);
            }
            // 被删用户的动态限速积累也一并清掉
            let mut traffic = self.traffic.lock().expect("traffic lock");
            if let Some(map) = traffic.as_mut() {
                for user in &deleted {
                    map.remove(&user.uuid);
                }
            }
        }
        if !updated.is_empty() {
            if let Some(limiter) = self.limiter() {
                limiter.update_user_limits(tag, &updated);
            }
            info!(tag = tag, updated = updated.len(), "user limits updated");
        }

        *self.user_list.lock().expect("user list lock") = new_users;
        if !added.is_empty() || !deleted.is_empty() || !updated.is_empty() {
            info!(
                tag = tag,
                deleted = deleted.len(),
                added = added.len(),
                updated = updated.len(),
                "user list reconciled"
            );
        }
    }

    /// 动态限速检查：窗口内超量的用户压到配置的速率
    pub async fn speed_check_once(&self) {
        let config = &self.options.limit.dynamic_speed_limit;
        let tag = self.tag();
        let over: Vec<(String, i64)> = {
            let mut traffic = self.traffic.lock().expect("traffic lock");
            let Some(map) = traffic.as_mut() else {
                return;
            };
            let over: Vec<(String, i64)> = map
                .iter()
                .filter(|(_, bytes)| **bytes >= config.traffic)
                .map(|(uuid, bytes)| (uuid.clone(), *bytes))
                .collect();
            for (uuid, _) in &over {
                map.remove(uuid);
            }
            over
        };
        if over.is_empty() {
            return;
        }

        let Some(limiter) = self.limiter() else {
            return;
        };
        let users = self.user_list.lock().expect("user list lock").clone();
        for (uuid, bytes) in over {
            let Some(user) = users.iter().find(|u| u.uuid == uuid) else {
                continue;
            };
            limiter.add_dynamic_speed_limit(&tag, user, config.speed_limit, config.expire_time * 60);
            info!(
                tag = tag.as_str(),
                user = uuid.as_str(),
                window_bytes = bytes,
                limit_mbps = config.speed_limit,
                expire_minutes = config.expire_time,
                "dynamic speed limit imposed"
            );
        }
    }

    /// 证书续期一轮：失败只告警，绝不中断
    pub async fn renew_cert_once(&self) {
        match self.cert.renew_if_due(&self.options.cert).await {
            Ok(true) => info!(domain = self.options.cert.cert_domain.as_str(), "certificate renewed"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "renew cert failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn periodic_runs_on_interval_until_closed() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let periodic = spawn_periodic("test", Duration::from_secs(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        // 首次执行在一个完整间隔之后
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        periodic.close();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
