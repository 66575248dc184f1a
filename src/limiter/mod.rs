//! 按节点的限制引擎
//!
//! 每个入站 tag 一个 `Limiter`，保存规则、在线 IP 表、设备上限、
//! 限速桶与 UUID→UID 映射。进程级注册表按 tag 索引，读多写少，
//! 写只发生在节点增删时。
//!
//! 不变量：`uuid_to_uid[uuid]` 与 `user_limits[tag|uuid].uid` 一致；
//! 任何在线连接，当且仅当有效速率非零时存在对应的限速桶。

mod dynamic;
mod rule;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::common::rate::RateBucket;
use crate::common::{user_tag, Error};
use crate::config::LimitConfig;
use crate::panel::{OnlineUser, UserInfo};

pub use dynamic::min_non_zero;

/// 单用户的可变限制记录
#[derive(Debug, Default)]
pub struct UserLimitInfo {
    pub uid: i32,
    /// 静态限速（Mbps），0 不限
    pub speed_limit: AtomicI32,
    /// 设备上限，0 不限
    pub device_limit: AtomicI32,
    /// 动态限速（Mbps），到期清零
    pub dynamic_speed_limit: AtomicI32,
    /// 动态限速到期时间（unix 秒），0 表示无动态限速
    pub expire_time: AtomicI64,
    pub over_limit: AtomicBool,
}

impl UserLimitInfo {
    fn from_user(user: &UserInfo) -> Self {
        let info = Self {
            uid: user.id,
            ..Default::default()
        };
        info.speed_limit.store(user.speed_limit, Ordering::Relaxed);
        info.device_limit.store(user.device_limit, Ordering::Relaxed);
        info
    }
}

pub struct Limiter {
    /// 节点级速率上限（Mbps），0 不限
    node_speed_limit: i32,
    domain_rules: RwLock<Vec<Regex>>,
    protocol_rules: RwLock<Vec<String>>,
    uuid_to_uid: RwLock<HashMap<String, i32>>,
    /// key: tag|uuid
    user_limits: RwLock<HashMap<String, Arc<UserLimitInfo>>>,
    /// 本窗口在线 IP。key: tag|uuid, value: ip -> uid
    online: Mutex<HashMap<String, HashMap<String, i32>>>,
    /// 上一窗口排空的在线 IP，设备在窗口间重现时不重复计数
    old_online: Mutex<HashMap<String, i32>>,
    /// key: tag|uuid
    buckets: RwLock<HashMap<String, Arc<RateBucket>>>,
    /// 面板侧权威设备计数 uid -> alive_ip
    alive: RwLock<HashMap<i32, i32>>,
}

impl Limiter {
    pub fn new(config: &LimitConfig, tag: &str, users: &[UserInfo], alive: HashMap<i32, i32>) -> Self {
        let mut uuid_map = HashMap::with_capacity(users.len());
        let mut limits = HashMap::with_capacity(users.len());
        for user in users {
            uuid_map.insert(user.uuid.clone(), user.id);
            limits.insert(user_tag(tag, &user.uuid), Arc::new(UserLimitInfo::from_user(user)));
        }
        Self {
            node_speed_limit: config.speed_limit,
            domain_rules: RwLock::new(Vec::new()),
            protocol_rules: RwLock::new(Vec::new()),
            uuid_to_uid: RwLock::new(uuid_map),
            user_limits: RwLock::new(limits),
            online: Mutex::new(HashMap::new()),
            old_online: Mutex::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            alive: RwLock::new(alive),
        }
    }

    /// 刷新面板侧在线设备计数
    pub fn set_alive(&self, alive: HashMap<i32, i32>) {
        *self.alive.write().expect("alive lock") = alive;
    }

    pub fn uid_of(&self, uuid: &str) -> Option<i32> {
        self.uuid_to_uid.read().expect("uuid lock").get(uuid).copied()
    }

    pub fn user_count(&self) -> usize {
        self.uuid_to_uid.read().expect("uuid lock").len()
    }

    pub fn user_limit(&self, taguuid: &str) -> Option<Arc<UserLimitInfo>> {
        self.user_limits.read().expect("limits lock").get(taguuid).cloned()
    }

    /// 连接/包准入检查
    ///
    /// 返回 `(桶, 是否拒绝)`。未知用户一律拒绝；`count_device` 为
    /// 真时把来源 IP 记入设备表并做设备上限检查（shadowsocks 的
    /// UDP 关联不计设备）。有效速率非零时返回该用户的限速桶。
    pub fn check_limit(
        &self,
        taguuid: &str,
        ip: &str,
        _is_tcp: bool,
        count_device: bool,
    ) -> (Option<Arc<RateBucket>>, bool) {
        // IPv4 映射的 IPv6 地址归一化
        let ip = ip.strip_prefix("::ffff:").unwrap_or(ip);

        let Some(info) = self.user_limit(taguuid) else {
            return (None, true);
        };
        let uid = info.uid;
        let device_limit = info.device_limit.load(Ordering::Relaxed);

        let now = unix_now();
        let expire = info.expire_time.load(Ordering::Relaxed);
        let user_speed = if expire != 0 && expire < now {
            let static_speed = info.speed_limit.load(Ordering::Relaxed);
            if static_speed != 0 {
                // 动态限速到期，回到静态限速
                info.dynamic_speed_limit.store(0, Ordering::Relaxed);
                info.expire_time.store(0, Ordering::Relaxed);
                static_speed
            } else {
                // 纯动态记录到期，条目整体清除
                self.user_limits.write().expect("limits lock").remove(taguuid);
                0
            }
        } else {
            min_non_zero(
                info.speed_limit.load(Ordering::Relaxed),
                info.dynamic_speed_limit.load(Ordering::Relaxed),
            )
        };

        if count_device {
            let alive_count = self.alive.read().expect("alive lock").get(&uid).copied().unwrap_or(0);
            let mut online = self.online.lock().expect("online lock");
            let known = online.get(taguuid).is_some_and(|m| m.contains_key(ip));
            if !known {
                let continuing = {
                    let mut old = self.old_online.lock().expect("old online lock");
                    match old.get(ip) {
                        Some(&old_uid) if old_uid == uid => {
                            old.remove(ip);
                            true
                        }
                        _ => false,
                    }
                };
                if !continuing && device_limit > 0 {
                    let observed = online.get(taguuid).map_or(0, |m| m.len()) as i32;
                    if observed >= device_limit || alive_count >= device_limit {
                        info.over_limit.store(true, Ordering::Relaxed);
                        return (None, true);
                    }
                }
                online
                    .entry(taguuid.to_string())
                    .or_default()
                    .insert(ip.to_string(), uid);
            }
        }

        info.over_limit.store(false, Ordering::Relaxed);

        let rate_mbps = min_non_zero(self.node_speed_limit, user_speed);
        let rate_bytes = rate_mbps as i64 * 1_000_000 / 8;
        if rate_bytes > 0 {
            (Some(self.bucket_for(taguuid, rate_bytes as u64)), false)
        } else {
            (None, false)
        }
    }

    /// 取或建限速桶。速率变化通过删桶触发重建，不调整现有桶。
    fn bucket_for(&self, taguuid: &str, rate_bytes: u64) -> Arc<RateBucket> {
        if let Some(bucket) = self.buckets.read().expect("bucket lock").get(taguuid) {
            return bucket.clone();
        }
        let mut buckets = self.buckets.write().expect("bucket lock");
        buckets
            .entry(taguuid.to_string())
            .or_insert_with(|| Arc::new(RateBucket::new(rate_bytes)))
            .clone()
    }

    /// 用户增删。删除的用户连带清掉在线 IP、限速桶与 alive 记录。
    pub fn update_user(&self, tag: &str, added: &[UserInfo], deleted: &[UserInfo]) {
        {
            let mut limits = self.user_limits.write().expect("limits lock");
            let mut uuid_map = self.uuid_to_uid.write().expect("uuid lock");
            let mut online = self.online.lock().expect("online lock");
            let mut buckets = self.buckets.write().expect("bucket lock");
            let mut alive = self.alive.write().expect("alive lock");
            for user in deleted {
                let key = user_tag(tag, &user.uuid);
                limits.remove(&key);
                online.remove(&key);
                buckets.remove(&key);
                uuid_map.remove(&user.uuid);
                alive.remove(&user.id);
            }
            for user in added {
                limits.insert(user_tag(tag, &user.uuid), Arc::new(UserLimitInfo::from_user(user)));
                uuid_map.insert(user.uuid.clone(), user.id);
            }
        }
    }

    /// 限制变更热路径：原地改记录，不动入站侧的用户注册。
    ///
    /// 限速变化删桶让下次准入按新速率重建；设备上限收紧时清空
    /// 在线记录强制重新计数。
    pub fn update_user_limits(&self, tag: &str, updated: &[UserInfo]) {
        for user in updated {
            let key = user_tag(tag, &user.uuid);
            let Some(info) = self.user_limit(&key) else {
                continue;
            };
            let old_speed = info.speed_limit.load(Ordering::Relaxed);
            if user.speed_limit != old_speed {
                info.speed_limit.store(user.speed_limit, Ordering::Relaxed);
                self.buckets.write().expect("bucket lock").remove(&key);
            }
            let old_device = info.device_limit.load(Ordering::Relaxed);
            if user.device_limit != old_device {
                info.device_limit.store(user.device_limit, Ordering::Relaxed);
                if user.device_limit > 0 && (old_device == 0 || user.device_limit < old_device) {
                    self.online.lock().expect("online lock").remove(&key);
                }
            }
        }
    }

    /// 排空本窗口在线表：产出上报载荷，并把排空的条目移入
    /// 上一窗口表供准入判断设备连续性，恰好存续一个窗口。
    pub fn get_online_device(&self) -> Vec<OnlineUser> {
        let drained: HashMap<String, HashMap<String, i32>> =
            std::mem::take(&mut *self.online.lock().expect("online lock"));
        let mut result = Vec::new();
        let mut old = HashMap::new();
        for ip_map in drained.into_values() {
            for (ip, uid) in ip_map {
                old.insert(ip.clone(), uid);
                result.push(OnlineUser { uid, ip });
            }
        }
        *self.old_online.lock().expect("old online lock") = old;
        result
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ─── 进程级注册表 ───

static LIMITERS: OnceLock<RwLock<HashMap<String, Arc<Limiter>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Arc<Limiter>>> {
    LIMITERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// 注册一个节点的 limiter，同 tag 覆盖旧实例
pub fn add_limiter(
    tag: &str,
    config: &LimitConfig,
    users: &[UserInfo],
    alive: HashMap<i32, i32>,
) -> Arc<Limiter> {
    let limiter = Arc::new(Limiter::new(config, tag, users, alive));
    registry()
        .write()
        .expect("limiter registry lock")
        .insert(tag.to_string(), limiter.clone());
    limiter
}

pub fn get_limiter(tag: &str) -> Result<Arc<Limiter>, Error> {
    registry()
        .read()
        .expect("limiter registry lock")
        .get(tag)
        .cloned()
        .ok_or_else(|| Error::LimiterNotFound(tag.to_string()))
}

pub fn delete_limiter(tag: &str) {
    registry().write().expect("limiter registry lock").remove(tag);
}
