//! 用户流量上报与列表对账

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::panel::{UserInfo, UserTraffic};

use super::controller::Controller;

impl Controller {
    /// 上报一轮：流量切片（取值即清零）POST 给面板，随后排空在线
    /// 设备表，把窗口内流量低于门槛的用户挡在设备名单外再上报。
    pub async fn report_once(self: &Arc<Self>) {
        let round_start = Instant::now();
        let tag = self.tag();

        let traffic = self.core.user_traffic_slice(&tag, true).await;
        if !traffic.is_empty() {
            self.accumulate_for_speed_checker(&traffic);
            let t0 = Instant::now();
            match self.api.report_user_traffic(&traffic).await {
                Ok(()) => info!(tag = tag.as_str(), users = traffic.len(), "reported user traffic"),
                Err(e) => warn!(
                    tag = tag.as_str(),
                    error = %e,
                    dur_ms = t0.elapsed().as_millis() as u64,
                    "report user traffic failed"
                ),
            }
        }

        let Some(limiter) = self.limiter() else {
            return;
        };
        let online = limiter.get_online_device();
        if online.is_empty() {
            debug!(
                tag = tag.as_str(),
                dur_ms = round_start.elapsed().as_millis() as u64,
                "report round finished"
            );
            return;
        }

        // 低于门槛的用户不进设备名单，免得 ping 测速也占设备数
        let min_bytes = self.options.device_online_min_traffic * 1000;
        let mut idle_uids = std::collections::HashSet::new();
        for t in &traffic {
            if t.upload + t.download < min_bytes {
                idle_uids.insert(t.uid);
            }
        }

        let total = online.len();
        let mut data: HashMap<i32, Vec<String>> = HashMap::new();
        for user in online {
            if idle_uids.contains(&user.uid) {
                continue;
            }
            data.entry(user.uid).or_default().push(user.ip);
        }

        if !data.is_empty() {
            let reported: usize = data.values().map(|ips| ips.len()).sum();
            match self.api.report_node_online_users(&data).await {
                Ok(()) => info!(tag = tag.as_str(), online = total, reported = reported, "reported online devices"),
                Err(e) => warn!(tag = tag.as_str(), error = %e, "report online users failed"),
            }
        }
        debug!(
            tag = tag.as_str(),
            dur_ms = round_start.elapsed().as_millis() as u64,
            "report round finished"
        );
    }

    /// 动态限速开着时，把本轮流量按 uuid 累进检查器的窗口
    fn accumulate_for_speed_checker(&self, traffic: &[UserTraffic]) {
        let mut accumulator = self.traffic.lock().expect("traffic lock");
        let Some(map) = accumulator.as_mut() else {
            return;
        };
        let users = self.user_list.lock().expect("user list lock");
        let uuid_of: HashMap<i32, &str> = users.iter().map(|u| (u.id, u.uuid.as_str())).collect();
        for t in traffic {
            if let Some(uuid) = uuid_of.get(&t.uid) {
                *map.entry(uuid.to_string()).or_insert(0) += t.upload + t.download;
            }
        }
    }
}

/// 新旧列表按 UUID 求差
///
/// `updated` 指同一 UUID 但 speed_limit 或 device_limit 变了的用户，
/// 走热路径，不动入站侧的用户注册。
pub fn compare_user_list(
    old: &[UserInfo],
    new: &[UserInfo],
) -> (Vec<UserInfo>, Vec<UserInfo>, Vec<UserInfo>) {
    let mut old_map: HashMap<&str, &UserInfo> = HashMap::with_capacity(old.len());
    for user in old {
        old_map.insert(user.uuid.as_str(), user);
    }

    let mut added = Vec::new();
    let mut updated = Vec::new();
    for user in new {
        match old_map.remove(user.uuid.as_str()) {
            Some(previous) => {
                if previous.speed_limit != user.speed_limit
                    || previous.device_limit != user.device_limit
                {
                    updated.push(user.clone());
                }
            }
            None => added.push(user.clone()),
        }
    }
    let deleted: Vec<UserInfo> = old_map.into_values().cloned().collect();

    (deleted, added, updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i32, uuid: &str, speed: i32, device: i32) -> UserInfo {
        UserInfo {
            id,
            uuid: uuid.to_string(),
            speed_limit: speed,
            device_limit: device,
            conn_limit: 0,
        }
    }

    #[test]
    fn identical_lists_produce_no_diff() {
        let list = vec![user(1, "a", 0, 0), user(2, "b", 10, 2)];
        let (deleted, added, updated) = compare_user_list(&list, &list);
        assert!(deleted.is_empty());
        assert!(added.is_empty());
        assert!(updated.is_empty());
    }

    #[test]
    fn limit_change_is_update_not_readd() {
        let old = vec![user(1, "a", 0, 0), user(2, "b", 10, 2), user(3, "c", 0, 0)];
        let new = vec![user(1, "a", 0, 0), user(2, "b", 20, 2)];
        let (deleted, added, updated) = compare_user_list(&old, &new);
        assert_eq!(deleted, vec![user(3, "c", 0, 0)]);
        assert!(added.is_empty());
        assert_eq!(updated, vec![user(2, "b", 20, 2)]);
    }

    #[test]
    fn new_uuid_is_added() {
        let old = vec![user(1, "a", 0, 0)];
        let new = vec![user(1, "a", 0, 0), user(9, "z", 0, 0)];
        let (deleted, added, updated) = compare_user_list(&old, &new);
        assert!(deleted.is_empty());
        assert_eq!(added, vec![user(9, "z", 0, 0)]);
        assert!(updated.is_empty());
    }

    #[test]
    fn uid_change_alone_is_not_an_update() {
        // UUID 才是身份键；uid 变化不触发任何动作
        let old = vec![user(1, "a", 0, 0)];
        let new = vec![user(2, "a", 0, 0)];
        let (deleted, added, updated) = compare_user_list(&old, &new);
        assert!(deleted.is_empty());
        assert!(added.is_empty());
        assert!(updated.is_empty());
    }
}
