//! 令牌桶限速
//!
//! 桶按有效速率（字节/秒）建，满桶起步。流包装器在读写前
//! 为请求的字节数取足令牌；UDP 包装器接收后、发送前按载荷
//! 长度等待。

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{PacketTransport, ProxyStream, UdpPacket};

/// 令牌桶，速率与容量均为字节/秒
pub struct RateBucket {
    tokens: AtomicI64,
    capacity: i64,
    /// 每秒补充的令牌数（字节/秒）
    rate: i64,
    last_refill: Mutex<Instant>,
}

impl RateBucket {
    pub fn new(bytes_per_second: u64) -> Self {
        let capacity = bytes_per_second.max(1) as i64;
        Self {
            tokens: AtomicI64::new(capacity),
            capacity,
            rate: capacity,
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// 尝试消费 `n` 个令牌，返回实际消费数
    pub fn try_consume(&self, n: u64) -> u64 {
        self.refill();
        let n = n as i64;
        let available = self.tokens.load(Ordering::Relaxed);
        let consume = n.min(available).max(0);
        if consume > 0 {
            self.tokens.fetch_sub(consume, Ordering::Relaxed);
        }
        consume as u64
    }

    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn rate(&self) -> u64 {
        self.rate as u64
    }

    fn refill(&self) {
        let mut last = match self.last_refill.lock() {
            Ok(guard) => guard,
            Err(_poisoned) => return,
        };
        let now = Instant::now();
        let elapsed = now.duration_since(*last);
        let new_tokens = (elapsed.as_millis() as i64 * self.rate) / 1000;
        if new_tokens > 0 {
            let current = self.tokens.load(Ordering::Relaxed);
            let refilled = (current + new_tokens).min(self.capacity);
            self.tokens.store(refilled, Ordering::Relaxed);
            *last = now;
        }
    }

    /// 等待直到取足 `n` 个令牌。按剩余字节数成比例休眠，避免忙等。
    pub async fn wait(&self, n: u64) {
        let mut remaining = n;
        while remaining > 0 {
            let consumed = self.try_consume(remaining);
            remaining -= consumed;
            if remaining > 0 {
                tokio::time::sleep(wait_duration(remaining, self.rate())).await;
            }
        }
    }
}

fn wait_duration(remaining: u64, rate: u64) -> Duration {
    let rate = rate.max(1);
    let wait_ms = ((remaining as u128 * 1000) / rate as u128).max(1).min(100) as u64;
    Duration::from_millis(wait_ms)
}

/// 限速流包装器
///
/// 读写均先为请求的缓冲区长度取足令牌再进入底层操作，
/// 令牌不足时挂起当前任务直到补充。
pub struct RatedStream {
    inner: ProxyStream,
    bucket: Arc<RateBucket>,
    read_debit: Debit,
    write_debit: Debit,
}

/// 单方向的取令牌状态机
#[derive(Default)]
struct Debit {
    /// 还差多少令牌；0 表示本次操作已取足
    pending: u64,
    /// 取足后在底层操作 Pending 期间保持，避免重复扣费
    acquired: bool,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl Debit {
    /// 为 `want` 字节取令牌。返回 Ready 表示已取足。
    fn poll_acquire(
        &mut self,
        bucket: &RateBucket,
        want: u64,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        if self.acquired {
            return Poll::Ready(());
        }
        if self.pending == 0 {
            self.pending = want;
        }
        loop {
            if let Some(sleep) = self.sleep.as_mut() {
                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => self.sleep = None,
                    Poll::Pending => return Poll::Pending,
                }
            }
            let consumed = bucket.try_consume(self.pending);
            self.pending -= consumed;
            if self.pending == 0 {
                self.acquired = true;
                return Poll::Ready(());
            }
            self.sleep = Some(Box::pin(tokio::time::sleep(wait_duration(
                self.pending,
                bucket.rate(),
            ))));
        }
    }

    fn settle(&mut self) {
        self.acquired = false;
        self.pending = 0;
        self.sleep = None;
    }
}

impl RatedStream {
    pub fn new(inner: ProxyStream, bucket: Arc<RateBucket>) -> Self {
        Self {
            inner,
            bucket,
            read_debit: Debit::default(),
            write_debit: Debit::default(),
        }
    }
}

impl AsyncRead for RatedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let want = buf.remaining() as u64;
        if want > 0 {
            match this.read_debit.poll_acquire(&this.bucket, want, cx) {
                Poll::Ready(()) => {}
                Poll::Pending => return Poll::Pending,
            }
        }
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if result.is_ready() {
            this.read_debit.settle();
        }
        result
    }
}

impl AsyncWrite for RatedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let want = buf.len() as u64;
        if want > 0 {
            match this.write_debit.poll_acquire(&this.bucket, want, cx) {
                Poll::Ready(()) => {}
                Poll::Pending => return Poll::Pending,
            }
        }
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if result.is_ready() {
            this.write_debit.settle();
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

/// 限速 UDP 包装器：接收后按载荷长度等待，发送前等待
pub struct RatedPacketTransport {
    inner: Box<dyn PacketTransport>,
    bucket: Arc<RateBucket>,
}

impl RatedPacketTransport {
    pub fn new(inner: Box<dyn PacketTransport>, bucket: Arc<RateBucket>) -> Self {
        Self { inner, bucket }
    }
}

#[async_trait::async_trait]
impl PacketTransport for RatedPacketTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        let len = packet.data.len() as u64;
        if len > 0 {
            self.bucket.wait(len).await;
        }
        self.inner.send(packet).await
    }

    async fn recv(&self) -> Result<UdpPacket> {
        let packet = self.inner.recv().await?;
        let len = packet.data.len() as u64;
        if len > 0 {
            self.bucket.wait(len).await;
        }
        Ok(packet)
    }
}
