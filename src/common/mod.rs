pub mod counter;
pub mod error;
pub mod rate;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

pub use error::Error;

/// 代理流类型别名：任何实现了 AsyncRead + AsyncWrite + Send + Unpin 的类型
pub type ProxyStream = Box<dyn AsyncStream>;

/// 异步流 trait，组合 AsyncRead + AsyncWrite
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// UDP 数据包
pub struct UdpPacket {
    /// 目标(发送)或来源(接收)地址，host:port 形式
    pub addr: String,
    /// 载荷
    pub data: Bytes,
}

/// UDP 传输抽象 trait
#[async_trait]
pub trait PacketTransport: Send + Sync {
    async fn send(&self, packet: UdpPacket) -> Result<()>;
    async fn recv(&self) -> Result<UdpPacket>;
}

/// 类型擦除的 UDP 传输
pub type BoxPacketTransport = Box<dyn PacketTransport>;

/// 组合 tag 和 uuid 生成跨 limiter/counter/入站注册表的唯一键
pub fn user_tag(tag: &str, uuid: &str) -> String {
    let mut key = String::with_capacity(tag.len() + 1 + uuid.len());
    key.push_str(tag);
    key.push('|');
    key.push_str(uuid);
    key
}
