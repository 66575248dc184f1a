//! 入站钩子
//!
//! 引擎的分发器在每条已认证的流上调两个钩子：准入钩子做限速/
//! 设备/规则检查并按需包一层限速读写，记账钩子把字节计入该 tag
//! 的流量计数器。被接受的连接注册一个可关闭句柄，用户被删时
//! 统一断开；句柄在连接结束时随 Drop 自行注销（once 语义）。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{info, warn};

use crate::common::counter::{CountedStream, TrafficCounter};
use crate::common::rate::{RatedPacketTransport, RatedStream};
use crate::common::{user_tag, BoxPacketTransport, PacketTransport, ProxyStream, UdpPacket};
use crate::limiter;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// 一条流/包会话的元数据，由入站引擎在认证后填好
pub struct SessionMeta<'a> {
    pub inbound_tag: &'a str,
    pub user_uuid: &'a str,
    pub source_ip: &'a str,
    pub dest_host: &'a str,
    /// 嗅探出的传输协议，空则不做协议规则检查
    pub protocol: &'a str,
}

/// 在线连接句柄表，独立 Arc 让句柄能在 Drop 里注销自己
#[derive(Default)]
struct ConnTracker {
    connections: Mutex<HashMap<String, HashMap<u64, CancellationToken>>>,
}

impl ConnTracker {
    fn register(self: &Arc<Self>, taguuid: &str) -> ConnGuard {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.connections
            .lock()
            .expect("connection lock")
            .entry(taguuid.to_string())
            .or_default()
            .insert(id, token.clone());
        ConnGuard {
            id,
            taguuid: taguuid.to_string(),
            token,
            tracker: self.clone(),
        }
    }

    fn deregister(&self, taguuid: &str, id: u64) {
        let mut conns = self.connections.lock().expect("connection lock");
        if let Some(set) = conns.get_mut(taguuid) {
            set.remove(&id);
            if set.is_empty() {
                conns.remove(taguuid);
            }
        }
    }

    fn cancel_user(&self, taguuid: &str) {
        let tokens = self.connections.lock().expect("connection lock").remove(taguuid);
        if let Some(tokens) = tokens {
            for token in tokens.into_values() {
                token.cancel();
            }
        }
    }

    fn cancel_tag(&self, tag: &str) {
        let prefix = format!("{}|", tag);
        let drained: Vec<HashMap<u64, CancellationToken>> = {
            let mut conns = self.connections.lock().expect("connection lock");
            let keys: Vec<String> = conns.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
            keys.into_iter().filter_map(|k| conns.remove(&k)).collect()
        };
        for tokens in drained {
            for token in tokens.into_values() {
                token.cancel();
            }
        }
    }

    fn count(&self, taguuid: &str) -> usize {
        self.connections
            .lock()
            .expect("connection lock")
            .get(taguuid)
            .map_or(0, |m| m.len())
    }
}

#[derive(Default)]
pub struct HookServer {
    /// 入站 tag → 该 tag 的流量计数器
    counters: RwLock<HashMap<String, Arc<TrafficCounter>>>,
    tracker: Arc<ConnTracker>,
}

impl HookServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_of(&self, tag: &str) -> Option<Arc<TrafficCounter>> {
        self.counters.read().expect("counter lock").get(tag).cloned()
    }

    /// 取或建某 tag 的计数器
    pub fn counter_for(&self, tag: &str) -> Arc<TrafficCounter> {
        if let Some(c) = self.counter_of(tag) {
            return c;
        }
        self.counters
            .write()
            .expect("counter lock")
            .entry(tag.to_string())
            .or_default()
            .clone()
    }

    /// 准入 + 记账钩子（TCP 流）。返回 `None` 表示拒绝，调用方
    /// 丢弃流即关闭连接。
    pub fn routed_connection(&self, meta: &SessionMeta<'_>, stream: ProxyStream) -> Option<ProxyStream> {
        let limiter = match limiter::get_limiter(meta.inbound_tag) {
            Ok(l) => l,
            Err(e) => {
                warn!(tag = meta.inbound_tag, error = %e, "no limiter for inbound, passing through");
                return Some(stream);
            }
        };
        let key = user_tag(meta.inbound_tag, meta.user_uuid);

        let (bucket, reject) = limiter.check_limit(&key, meta.source_ip, true, true);
        if reject {
            info!(
                tag = meta.inbound_tag,
                user = meta.user_uuid,
                ip = meta.source_ip,
                "connection rejected by device or user limit"
            );
            return None;
        }
        if self.rule_rejects(&limiter, meta) {
            return None;
        }

        let mut stream = stream;
        if let Some(bucket) = bucket {
            stream = Box::new(RatedStream::new(stream, bucket));
        }
        let storage = self.counter_for(meta.inbound_tag).get_counter(&key);
        stream = Box::new(CountedStream::new(stream, storage));

        let guard = self.tracker.register(&key);
        let cancelled = Box::pin(guard.token.clone().cancelled_owned());
        Some(Box::new(TrackedStream {
            inner: stream,
            cancelled,
            _guard: guard,
        }))
    }

    /// 准入 + 记账钩子（UDP）。`count_device` 为假时不把来源 IP
    /// 计为设备（shadowsocks 的 UDP 关联）。
    pub fn routed_packet(
        &self,
        meta: &SessionMeta<'_>,
        count_device: bool,
        transport: BoxPacketTransport,
    ) -> Option<BoxPacketTransport> {
        let limiter = match limiter::get_limiter(meta.inbound_tag) {
            Ok(l) => l,
            Err(e) => {
                warn!(tag = meta.inbound_tag, error = %e, "no limiter for inbound, passing through");
                return Some(transport);
            }
        };
        let key = user_tag(meta.inbound_tag, meta.user_uuid);

        let (bucket, reject) = limiter.check_limit(&key, meta.source_ip, false, count_device);
        if reject {
            info!(
                tag = meta.inbound_tag,
                user = meta.user_uuid,
                ip = meta.source_ip,
                "packet session rejected by device or user limit"
            );
            return None;
        }
        if self.rule_rejects(&limiter, meta) {
            return None;
        }

        let mut transport = transport;
        if let Some(bucket) = bucket {
            transport = Box::new(RatedPacketTransport::new(transport, bucket));
        }
        let counter = self.counter_for(meta.inbound_tag);
        transport = Box::new(CountedPacketTransport {
            inner: transport,
            counter,
            key: key.clone(),
        });

        let guard = self.tracker.register(&key);
        Some(Box::new(TrackedPacketTransport {
            inner: transport,
            token: guard.token.clone(),
            _guard: guard,
        }))
    }

    fn rule_rejects(&self, limiter: &limiter::Limiter, meta: &SessionMeta<'_>) -> bool {
        if !meta.dest_host.is_empty() && limiter.check_domain_rule(meta.dest_host) {
            info!(
                tag = meta.inbound_tag,
                user = meta.user_uuid,
                dest = meta.dest_host,
                "destination rejected by domain rule"
            );
            return true;
        }
        if !meta.protocol.is_empty() && limiter.check_protocol_rule(meta.protocol) {
            info!(
                tag = meta.inbound_tag,
                user = meta.user_uuid,
                protocol = meta.protocol,
                "session rejected by protocol rule"
            );
            return true;
        }
        false
    }

    /// 断开并注销某用户的所有在线连接
    pub fn close_connections(&self, taguuid: &str) {
        self.tracker.cancel_user(taguuid);
    }

    /// 删除整个 tag 的计数器并断开其全部连接
    pub fn remove_tag(&self, tag: &str) {
        self.counters.write().expect("counter lock").remove(tag);
        self.tracker.cancel_tag(tag);
    }

    pub fn tracked_connections(&self, taguuid: &str) -> usize {
        self.tracker.count(taguuid)
    }
}

/// 连接句柄：Drop 时自动注销
struct ConnGuard {
    id: u64,
    taguuid: String,
    token: CancellationToken,
    tracker: Arc<ConnTracker>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.tracker.deregister(&self.taguuid, self.id);
    }
}

fn closed_err() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "connection closed by user removal")
}

/// 被跟踪的流：取消令牌触发时读写立刻失败
pub struct TrackedStream {
    inner: ProxyStream,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    _guard: ConnGuard,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(closed_err()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(closed_err()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// 被跟踪的 UDP 传输
pub struct TrackedPacketTransport {
    inner: BoxPacketTransport,
    token: CancellationToken,
    _guard: ConnGuard,
}

#[async_trait::async_trait]
impl PacketTransport for TrackedPacketTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(closed_err().into()),
            r = self.inner.send(packet) => r,
        }
    }

    async fn recv(&self) -> Result<UdpPacket> {
        tokio::select! {
            _ = self.token.cancelled() => Err(closed_err().into()),
            r = self.inner.recv() => r,
        }
    }
}

/// 计量 UDP 包装器：收计上行，发计下行
struct CountedPacketTransport {
    inner: BoxPacketTransport,
    counter: Arc<TrafficCounter>,
    key: String,
}

#[async_trait::async_trait]
impl PacketTransport for CountedPacketTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        let len = packet.data.len();
        self.inner.send(packet).await?;
        self.counter.rx(&self.key, len);
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        let packet = self.inner.recv().await?;
        self.counter.tx(&self.key, packet.data.len());
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitConfig;
    use crate::panel::UserInfo;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn seed_limiter(tag: &str, users: &[UserInfo]) {
        limiter::add_limiter(tag, &LimitConfig::default(), users, HashMap::new());
    }

    fn user(id: i32, uuid: &str, speed: i32, device: i32) -> UserInfo {
        UserInfo {
            id,
            uuid: uuid.to_string(),
            speed_limit: speed,
            device_limit: device,
            conn_limit: 0,
        }
    }

    fn meta<'a>(tag: &'a str, uuid: &'a str, ip: &'a str) -> SessionMeta<'a> {
        SessionMeta {
            inbound_tag: tag,
            user_uuid: uuid,
            source_ip: ip,
            dest_host: "",
            protocol: "",
        }
    }

    #[tokio::test]
    async fn admission_wraps_and_counts() {
        let tag = "hook-count";
        seed_limiter(tag, &[user(1, "a", 0, 0)]);
        let hook = HookServer::new();

        let (client, server) = tokio::io::duplex(256);
        let mut wrapped = hook
            .routed_connection(&meta(tag, "a", "1.2.3.4"), Box::new(client))
            .unwrap();

        let server_task = tokio::spawn(async move {
            let mut server = server;
            let mut buf = [0u8; 8];
            let n = server.read(&mut buf).await.unwrap();
            server.write_all(&buf[..n]).await.unwrap();
        });
        wrapped.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        wrapped.read_exact(&mut buf).await.unwrap();
        server_task.await.unwrap();

        let counter = hook.counter_of(tag).unwrap();
        let key = user_tag(tag, "a");
        let (up, down) = counter.get_counter(&key).load();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
        limiter::delete_limiter(tag);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let tag = "hook-reject";
        seed_limiter(tag, &[]);
        let hook = HookServer::new();
        let (client, _server) = tokio::io::duplex(64);
        assert!(hook
            .routed_connection(&meta(tag, "ghost", "1.2.3.4"), Box::new(client))
            .is_none());
        limiter::delete_limiter(tag);
    }

    #[tokio::test]
    async fn missing_limiter_passes_through() {
        let hook = HookServer::new();
        let (client, _server) = tokio::io::duplex(64);
        assert!(hook
            .routed_connection(&meta("no-such-tag", "a", "1.2.3.4"), Box::new(client))
            .is_some());
    }

    #[tokio::test]
    async fn rules_reject_destination_and_protocol() {
        let tag = "hook-rule";
        let l = limiter::add_limiter(tag, &LimitConfig::default(), &[user(1, "a", 0, 0)], HashMap::new());
        l.update_rule(&crate::panel::Rules {
            regexp: vec![r"blocked\.example".to_string()],
            protocol: vec!["bittorrent".to_string()],
        });
        let hook = HookServer::new();

        let (client, _server) = tokio::io::duplex(64);
        let mut m = meta(tag, "a", "1.2.3.4");
        m.dest_host = "blocked.example";
        assert!(hook.routed_connection(&m, Box::new(client)).is_none());

        let (client, _server) = tokio::io::duplex(64);
        let mut m = meta(tag, "a", "1.2.3.4");
        m.protocol = "bittorrent";
        assert!(hook.routed_connection(&m, Box::new(client)).is_none());
        limiter::delete_limiter(tag);
    }

    #[tokio::test]
    async fn close_connections_aborts_live_stream() {
        let tag = "hook-close";
        seed_limiter(tag, &[user(1, "a", 0, 0)]);
        let hook = HookServer::new();

        let (client, _server) = tokio::io::duplex(64);
        let mut wrapped = hook
            .routed_connection(&meta(tag, "a", "1.2.3.4"), Box::new(client))
            .unwrap();
        let key = user_tag(tag, "a");
        assert_eq!(hook.tracked_connections(&key), 1);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            wrapped.read(&mut buf).await
        });
        // 等读任务挂起后砍掉该用户的连接
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        hook.close_connections(&key);

        let result = reader.await.unwrap();
        assert!(result.is_err());
        assert_eq!(hook.tracked_connections(&key), 0);
        limiter::delete_limiter(tag);
    }

    #[tokio::test]
    async fn guard_deregisters_on_normal_close() {
        let tag = "hook-drop";
        seed_limiter(tag, &[user(1, "a", 0, 0)]);
        let hook = HookServer::new();
        let key = user_tag(tag, "a");

        let (client, _server) = tokio::io::duplex(64);
        let wrapped = hook
            .routed_connection(&meta(tag, "a", "1.2.3.4"), Box::new(client))
            .unwrap();
        assert_eq!(hook.tracked_connections(&key), 1);
        drop(wrapped);
        assert_eq!(hook.tracked_connections(&key), 0);
        limiter::delete_limiter(tag);
    }

    #[tokio::test]
    async fn remove_tag_drops_counter_and_connections() {
        let tag = "hook-remove";
        seed_limiter(tag, &[user(1, "a", 0, 0)]);
        let hook = HookServer::new();
        let key = user_tag(tag, "a");

        let (client, _server) = tokio::io::duplex(64);
        let _wrapped = hook
            .routed_connection(&meta(tag, "a", "1.2.3.4"), Box::new(client))
            .unwrap();
        assert!(hook.counter_of(tag).is_some());
        hook.remove_tag(tag);
        assert!(hook.counter_of(tag).is_none());
        assert_eq!(hook.tracked_connections(&key), 0);
        limiter::delete_limiter(tag);
    }
}
