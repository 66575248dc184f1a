//! 按用户键的流量计数器
//!
//! 每个用户一条记录，上下行各一个原子计数器。连接/数据包包装器在
//! 读写路径上调用 `rx`/`tx`；上报端用 `swap` 原子地取值并清零，
//! 读取和清零之间穿插的流量计入下一个上报窗口。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::ProxyStream;

/// 单个用户的上下行字节存储
#[derive(Debug, Default)]
pub struct TrafficStorage {
    pub up: AtomicI64,
    pub down: AtomicI64,
}

impl TrafficStorage {
    /// 读取当前值，不清零
    pub fn load(&self) -> (i64, i64) {
        (self.up.load(Ordering::Acquire), self.down.load(Ordering::Acquire))
    }

    /// 原子地取出并清零
    pub fn take(&self) -> (i64, i64) {
        (self.up.swap(0, Ordering::AcqRel), self.down.swap(0, Ordering::AcqRel))
    }
}

/// 一个入站 tag 下所有用户的流量计数器
#[derive(Debug, Default)]
pub struct TrafficCounter {
    counters: RwLock<HashMap<String, Arc<TrafficStorage>>>,
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取用户的计数存储，不存在则创建
    pub fn get_counter(&self, user: &str) -> Arc<TrafficStorage> {
        if let Some(c) = self.counters.read().expect("counter lock").get(user) {
            return c.clone();
        }
        let mut w = self.counters.write().expect("counter lock");
        w.entry(user.to_string()).or_default().clone()
    }

    /// 下行（远端到客户端）计入
    pub fn rx(&self, user: &str, n: usize) {
        self.get_counter(user).down.fetch_add(n as i64, Ordering::AcqRel);
    }

    /// 上行（客户端到远端）计入
    pub fn tx(&self, user: &str, n: usize) {
        self.get_counter(user).up.fetch_add(n as i64, Ordering::AcqRel);
    }

    pub fn delete(&self, user: &str) {
        self.counters.write().expect("counter lock").remove(user);
    }

    /// 快照所有条目，便于遍历时不持锁
    pub fn entries(&self) -> Vec<(String, Arc<TrafficStorage>)> {
        self.counters
            .read()
            .expect("counter lock")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counters.read().expect("counter lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 计量连接包装器：读计入下行，写计入上行
pub struct CountedStream {
    inner: ProxyStream,
    storage: Arc<TrafficStorage>,
}

impl CountedStream {
    pub fn new(inner: ProxyStream, storage: Arc<TrafficStorage>) -> Self {
        Self { inner, storage }
    }
}

impl AsyncRead for CountedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.storage.up.fetch_add(n as i64, Ordering::AcqRel);
            }
        }
        result
    }
}

impl AsyncWrite for CountedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                self.storage.down.fetch_add(n as i64, Ordering::AcqRel);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn rx_tx_accumulate() {
        let c = TrafficCounter::new();
        c.rx("u", 100);
        c.rx("u", 50);
        c.tx("u", 30);
        let (up, down) = c.get_counter("u").load();
        assert_eq!(up, 30);
        assert_eq!(down, 150);
    }

    #[test]
    fn take_resets_to_zero() {
        let c = TrafficCounter::new();
        c.tx("u", 7);
        c.rx("u", 9);
        let storage = c.get_counter("u");
        assert_eq!(storage.take(), (7, 9));
        assert_eq!(storage.load(), (0, 0));
    }

    #[test]
    fn delete_removes_entry() {
        let c = TrafficCounter::new();
        c.rx("a", 1);
        c.rx("b", 1);
        c.delete("a");
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn get_counter_is_stable() {
        let c = TrafficCounter::new();
        let first = c.get_counter("u");
        first.up.fetch_add(5, Ordering::AcqRel);
        let second = c.get_counter("u");
        assert_eq!(second.load().0, 5);
    }

    #[tokio::test]
    async fn counted_stream_meters_both_directions() {
        let (client, server) = tokio::io::duplex(1024);
        let storage = Arc::new(TrafficStorage::default());
        let mut counted = CountedStream::new(Box::new(client), storage.clone());

        let server_task = tokio::spawn(async move {
            let mut server = server;
            let mut buf = [0u8; 16];
            let n = server.read(&mut buf).await.unwrap();
            server.write_all(&buf[..n]).await.unwrap();
        });

        counted.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = counted.read(&mut buf).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(n, 5);
        let (up, down) = storage.load();
        assert_eq!(down, 5); // written by us
        assert_eq!(up, 5); // read back
    }
}
