//! 动态限速：速度检查器对超量用户临时压速

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::common::user_tag;
use crate::panel::UserInfo;

use super::{unix_now, Limiter, UserLimitInfo};

impl Limiter {
    /// 给用户盖上动态限速戳，`expire_seconds` 秒后失效。
    /// 已有记录原地更新，缺失时建一条仅含动态限速的记录。
    pub fn add_dynamic_speed_limit(
        &self,
        tag: &str,
        user: &UserInfo,
        limit_mbps: i32,
        expire_seconds: i64,
    ) {
        let key = user_tag(tag, &user.uuid);
        let expire = unix_now() + expire_seconds;
        if let Some(info) = self.user_limit(&key) {
            info.dynamic_speed_limit.store(limit_mbps, Ordering::Relaxed);
            info.expire_time.store(expire, Ordering::Relaxed);
            // 换了速率，删桶让下次准入重建
            self.buckets.write().expect("bucket lock").remove(&key);
        } else {
            let info = UserLimitInfo {
                uid: user.id,
                ..Default::default()
            };
            info.dynamic_speed_limit.store(limit_mbps, Ordering::Relaxed);
            info.expire_time.store(expire, Ordering::Relaxed);
            self.user_limits
                .write()
                .expect("limits lock")
                .insert(key, Arc::new(info));
        }
    }
}

/// 取非零最小值：0 视为不限。两者皆零返回 0（不限）。
pub fn min_non_zero(a: i32, b: i32) -> i32 {
    if a == 0 {
        return b;
    }
    if b == 0 {
        return a;
    }
    a.min(b)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::LimitConfig;

    fn user(id: i32, uuid: &str, speed: i32) -> UserInfo {
        UserInfo {
            id,
            uuid: uuid.to_string(),
            speed_limit: speed,
            device_limit: 0,
            conn_limit: 0,
        }
    }

    #[test]
    fn min_non_zero_laws() {
        assert_eq!(min_non_zero(0, 0), 0);
        assert_eq!(min_non_zero(10, 0), 10);
        assert_eq!(min_non_zero(0, 7), 7);
        assert_eq!(min_non_zero(10, 7), 7);
        assert_eq!(min_non_zero(3, 20), 3);
    }

    #[test]
    fn dynamic_limit_caps_effective_rate() {
        let u = user(1, "a", 80);
        let l = Limiter::new(&LimitConfig::default(), "t", &[u.clone()], HashMap::new());
        l.add_dynamic_speed_limit("t", &u, 8, 600);
        let (bucket, reject) = l.check_limit("t|a", "1.1.1.1", true, true);
        assert!(!reject);
        // min(80, 8) = 8 Mbps = 1_000_000 字节/秒
        assert_eq!(bucket.unwrap().rate(), 1_000_000);
    }

    #[test]
    fn expired_dynamic_limit_reverts_to_static() {
        let u = user(1, "a", 80);
        let l = Limiter::new(&LimitConfig::default(), "t", &[u.clone()], HashMap::new());
        l.add_dynamic_speed_limit("t", &u, 8, -1);
        let (bucket, reject) = l.check_limit("t|a", "1.1.1.1", true, true);
        assert!(!reject);
        assert_eq!(bucket.unwrap().rate(), 10_000_000);
        let info = l.user_limit("t|a").unwrap();
        assert_eq!(info.dynamic_speed_limit.load(Ordering::Relaxed), 0);
        assert_eq!(info.expire_time.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn expired_dynamic_only_record_is_evicted() {
        let u = user(9, "ghost", 0);
        let l = Limiter::new(&LimitConfig::default(), "t", &[], HashMap::new());
        l.add_dynamic_speed_limit("t", &u, 8, -1);
        // 到期读取即清除，之后该用户回到「未知用户」状态
        let (_, first) = l.check_limit("t|ghost", "1.1.1.1", true, true);
        assert!(!first);
        assert!(l.user_limit("t|ghost").is_none());
        let (_, second) = l.check_limit("t|ghost", "1.1.1.1", true, true);
        assert!(second);
    }
}
