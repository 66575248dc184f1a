//! 端口跳跃 NAT 规则
//!
//! 在 nat 表的 PREROUTING 链加 UDP REDIRECT，把 "start-end" 段
//! 重定向到实际监听端口。规则 comment 带 `v2sp-hy2:<tag>`，删除
//! 按 comment 精确匹配；启动时按前缀清掉上次残留。没有 iptables
//! 能力时端口跳跃禁用并告警，不致命。

use anyhow::Result;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 规则 comment 前缀，用于归属识别与启动清理
pub const RULE_COMMENT_PREFIX: &str = "v2sp-hy2";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortHopping {
    pub start: u16,
    pub end: u16,
    /// hysteria2 实际监听的端口
    pub listen: u16,
}

fn iptables_cmd(ip_version: u8) -> &'static str {
    if ip_version == 6 {
        "ip6tables"
    } else {
        "iptables"
    }
}

fn rule_comment(tag: &str) -> String {
    format!("{}:{}", RULE_COMMENT_PREFIX, tag)
}

/// REDIRECT 规则参数（不含表/链操作本身）
fn rule_args(hopping: &PortHopping, comment: &str) -> Vec<String> {
    vec![
        "-p".into(),
        "udp".into(),
        "--dport".into(),
        format!("{}:{}", hopping.start, hopping.end),
        "-j".into(),
        "REDIRECT".into(),
        "--to-ports".into(),
        hopping.listen.to_string(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        comment.to_string(),
    ]
}

/// 从 `-L PREROUTING -n --line-numbers` 输出里找出带指定 comment
/// 的规则行号
fn matching_line_numbers(listing: &str, needle: &str) -> Vec<u32> {
    let mut lines = Vec::new();
    for line in listing.lines() {
        if !line.contains(needle) {
            continue;
        }
        if let Some(first) = line.split_whitespace().next() {
            if let Ok(n) = first.parse() {
                lines.push(n);
            }
        }
    }
    lines
}

pub struct NatManager;

impl NatManager {
    pub fn new() -> Self {
        Self
    }

    /// nat 表是否可用
    pub async fn has_capability(&self) -> bool {
        Command::new("iptables")
            .args(["-t", "nat", "-L", "-n"])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// 为节点安装 IPv4 与 IPv6 重定向规则。IPv6 失败只告警。
    pub async fn add_port_hopping(&self, tag: &str, hopping: &PortHopping) -> Result<()> {
        if hopping.start == 0 || hopping.end == 0 {
            return Ok(());
        }
        if hopping.start > hopping.end {
            anyhow::bail!("invalid port range: {}-{}", hopping.start, hopping.end);
        }
        let comment = rule_comment(tag);
        for ipv in [4u8, 6u8] {
            if let Err(e) = self.add_rule(ipv, hopping, &comment).await {
                warn!(tag = tag, ip_version = ipv, error = %e, "failed to add port hopping rule");
            }
        }
        info!(
            tag = tag,
            range = format!("{}-{}", hopping.start, hopping.end),
            listen = hopping.listen,
            "port hopping rules installed"
        );
        Ok(())
    }

    async fn add_rule(&self, ip_version: u8, hopping: &PortHopping, comment: &str) -> Result<()> {
        let cmd = iptables_cmd(ip_version);
        let args = rule_args(hopping, comment);

        // 已存在就跳过
        let mut check: Vec<String> = vec!["-t".into(), "nat".into(), "-C".into(), "PREROUTING".into()];
        check.extend(args.iter().cloned());
        if run_status(cmd, &check).await {
            debug!(ip_version = ip_version, "port hopping rule already present");
            return Ok(());
        }

        let mut add: Vec<String> = vec!["-t".into(), "nat".into(), "-A".into(), "PREROUTING".into()];
        add.extend(args);
        let output = Command::new(cmd).args(&add).output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "{} failed: {}",
                cmd,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// 删除某节点的规则（按完整 comment 匹配）
    pub async fn remove_port_hopping(&self, tag: &str) -> Result<()> {
        let comment = rule_comment(tag);
        for ipv in [4u8, 6u8] {
            if let Err(e) = self.remove_by_comment(ipv, &comment).await {
                warn!(tag = tag, ip_version = ipv, error = %e, "failed to remove port hopping rule");
            }
        }
        Ok(())
    }

    /// 清掉所有带本进程 comment 前缀的残留规则（启动/退出时）
    pub async fn cleanup_all(&self) {
        for ipv in [4u8, 6u8] {
            if let Err(e) = self.remove_by_comment(ipv, RULE_COMMENT_PREFIX).await {
                warn!(ip_version = ipv, error = %e, "stale rule cleanup failed");
            }
        }
    }

    async fn remove_by_comment(&self, ip_version: u8, needle: &str) -> Result<()> {
        let cmd = iptables_cmd(ip_version);
        let output = Command::new(cmd)
            .args(["-t", "nat", "-L", "PREROUTING", "-n", "--line-numbers"])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!("{} list failed", cmd);
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        let lines = matching_line_numbers(&listing, needle);
        // 从后往前删，行号才不会错位
        for line in lines.iter().rev() {
            let ok = run_status(cmd, &[
                "-t".into(),
                "nat".into(),
                "-D".into(),
                "PREROUTING".into(),
                line.to_string(),
            ])
            .await;
            if !ok {
                warn!(ip_version = ip_version, line = line, "failed to delete rule");
            }
        }
        if !lines.is_empty() {
            info!(ip_version = ip_version, removed = lines.len(), "cleaned port hopping rules");
        }
        Ok(())
    }
}

async fn run_status(cmd: &str, args: &[String]) -> bool {
    Command::new(cmd)
        .args(args)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_args_shape() {
        let args = rule_args(
            &PortHopping {
                start: 20000,
                end: 50000,
                listen: 443,
            },
            "v2sp-hy2:tag-a",
        );
        assert_eq!(
            args,
            vec![
                "-p", "udp", "--dport", "20000:50000", "-j", "REDIRECT", "--to-ports", "443",
                "-m", "comment", "--comment", "v2sp-hy2:tag-a",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
        );
    }

    #[test]
    fn comment_is_prefixed_with_tag() {
        assert_eq!(rule_comment("node-1"), "v2sp-hy2:node-1");
    }

    #[test]
    fn line_numbers_parsed_from_listing() {
        let listing = "\
Chain PREROUTING (policy ACCEPT)
num  target     prot opt source               destination
1    REDIRECT   udp  --  0.0.0.0/0            0.0.0.0/0            udp dpts:20000:50000 /* v2sp-hy2:a */ redir ports 443
2    REDIRECT   udp  --  0.0.0.0/0            0.0.0.0/0            udp dpts:1000:2000 /* other-tool */ redir ports 80
3    REDIRECT   udp  --  0.0.0.0/0            0.0.0.0/0            udp dpts:30000:40000 /* v2sp-hy2:b */ redir ports 8443
";
        assert_eq!(matching_line_numbers(listing, "v2sp-hy2:a"), vec![1]);
        assert_eq!(matching_line_numbers(listing, "v2sp-hy2"), vec![1, 3]);
        assert!(matching_line_numbers(listing, "v2sp-hy2:c").is_empty());
    }

    #[test]
    fn header_lines_are_ignored() {
        let listing = "Chain PREROUTING (policy ACCEPT)\nnum target\n";
        assert!(matching_line_numbers(listing, "v2sp-hy2").is_empty());
    }
}
