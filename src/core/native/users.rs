//! 协议用户构建
//!
//! 在任何锁外把面板用户转成入站侧的协议用户对象。vmess/vless
//! 要求合法 UUID；trojan 口令即 uuid；shadowsocks 2022 系列从
//! uuid 派生定长用户密钥。

use anyhow::Result;
use base64::Engine;

use crate::common::user_tag;
use crate::panel::{NodeInfo, NodePayload, UserInfo};

/// 入站用户注册表里的一条记录
#[derive(Debug, Clone)]
pub struct ProtocolUser {
    /// tag|uuid
    pub key: String,
    pub uuid: String,
    pub uid: i32,
    pub auth: UserAuth,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserAuth {
    Vmess {
        id: uuid::Uuid,
    },
    Vless {
        id: uuid::Uuid,
        flow: String,
    },
    Trojan {
        password: String,
    },
    Shadowsocks {
        method: String,
        password: String,
    },
}

/// 按节点类型批量构建协议用户
pub fn build_users(tag: &str, users: &[UserInfo], node: &NodeInfo) -> Result<Vec<ProtocolUser>> {
    let mut out = Vec::with_capacity(users.len());
    for user in users {
        let auth = match &node.payload {
            NodePayload::V(v) => {
                let id = uuid::Uuid::parse_str(&user.uuid)
                    .map_err(|e| anyhow::anyhow!("user {} has invalid uuid: {}", user.id, e))?;
                if node.node_type == "vless" {
                    UserAuth::Vless {
                        id,
                        flow: v.flow.clone(),
                    }
                } else {
                    UserAuth::Vmess { id }
                }
            }
            NodePayload::Trojan(_) => UserAuth::Trojan {
                password: user.uuid.clone(),
            },
            NodePayload::Shadowsocks(ss) => UserAuth::Shadowsocks {
                method: ss.cipher.clone(),
                password: ss_user_password(&ss.cipher, &user.uuid),
            },
            _ => anyhow::bail!("native core does not support node type {}", node.node_type),
        };
        out.push(ProtocolUser {
            key: user_tag(tag, &user.uuid),
            uuid: user.uuid.clone(),
            uid: user.id,
            auth,
        });
    }
    Ok(out)
}

/// 2022 系列密码套件要求 base64 的定长密钥，其余直接用 uuid
fn ss_user_password(cipher: &str, uuid: &str) -> String {
    let key_len = match cipher {
        "2022-blake3-aes-128-gcm" => 16,
        c if c.starts_with("2022") => 32,
        _ => return uuid.to_string(),
    };
    let mut key = uuid.as_bytes().to_vec();
    key.resize(key_len, 0);
    base64::engine::general_purpose::STANDARD.encode(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::NodeInfo;

    fn node(node_type: &str, body: &str) -> NodeInfo {
        NodeInfo::parse(body.as_bytes(), 1, node_type).unwrap()
    }

    fn user(id: i32, uuid: &str) -> UserInfo {
        UserInfo {
            id,
            uuid: uuid.to_string(),
            ..Default::default()
        }
    }

    const UUID_A: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[test]
    fn vmess_users_require_valid_uuid() {
        let n = node("vmess", r#"{"server_port": 443}"#);
        let built = build_users("t", &[user(1, UUID_A)], &n).unwrap();
        assert_eq!(built[0].key, format!("t|{}", UUID_A));
        assert!(matches!(built[0].auth, UserAuth::Vmess { .. }));

        assert!(build_users("t", &[user(2, "not-a-uuid")], &n).is_err());
    }

    #[test]
    fn vless_users_carry_flow() {
        let n = node("vless", r#"{"server_port": 443, "flow": "xtls-rprx-vision"}"#);
        let built = build_users("t", &[user(1, UUID_A)], &n).unwrap();
        let UserAuth::Vless { flow, .. } = &built[0].auth else {
            panic!("expected vless auth");
        };
        assert_eq!(flow, "xtls-rprx-vision");
    }

    #[test]
    fn trojan_password_is_uuid() {
        let n = node("trojan", r#"{"server_port": 443}"#);
        let built = build_users("t", &[user(1, "any-password")], &n).unwrap();
        assert_eq!(
            built[0].auth,
            UserAuth::Trojan {
                password: "any-password".to_string()
            }
        );
    }

    #[test]
    fn shadowsocks_2022_password_is_fixed_length_base64() {
        let n = node(
            "shadowsocks",
            r#"{"server_port": 8388, "cipher": "2022-blake3-aes-128-gcm", "server_key": "k"}"#,
        );
        let built = build_users("t", &[user(1, UUID_A)], &n).unwrap();
        let UserAuth::Shadowsocks { password, .. } = &built[0].auth else {
            panic!("expected ss auth");
        };
        let decoded = base64::engine::general_purpose::STANDARD.decode(password).unwrap();
        assert_eq!(decoded.len(), 16);
    }

    #[test]
    fn shadowsocks_plain_password_is_uuid() {
        let n = node(
            "shadowsocks",
            r#"{"server_port": 8388, "cipher": "aes-128-gcm", "server_key": "k"}"#,
        );
        let built = build_users("t", &[user(1, "plain")], &n).unwrap();
        let UserAuth::Shadowsocks { password, .. } = &built[0].auth else {
            panic!("expected ss auth");
        };
        assert_eq!(password, "plain");
    }
}
