//! 域名与协议阻断规则

use regex::Regex;
use tracing::warn;

use crate::panel::Rules;

use super::Limiter;

impl Limiter {
    /// 替换规则集。非法正则跳过并告警，不让单条坏规则拖垮整组。
    pub fn update_rule(&self, rules: &Rules) {
        let mut compiled = Vec::with_capacity(rules.regexp.len());
        for pattern in &rules.regexp {
            match Regex::new(pattern) {
                Ok(re) => compiled.push(re),
                Err(e) => warn!(pattern = pattern.as_str(), error = %e, "skipping invalid domain rule"),
            }
        }
        *self.domain_rules.write().expect("rule lock") = compiled;
        *self.protocol_rules.write().expect("rule lock") = rules.protocol.clone();
    }

    /// 目标域名命中任一正则即拒绝
    pub fn check_domain_rule(&self, destination: &str) -> bool {
        self.domain_rules
            .read()
            .expect("rule lock")
            .iter()
            .any(|re| re.is_match(destination))
    }

    /// 传输协议字面量匹配
    pub fn check_protocol_rule(&self, protocol: &str) -> bool {
        self.protocol_rules
            .read()
            .expect("rule lock")
            .iter()
            .any(|p| p == protocol)
    }
}
