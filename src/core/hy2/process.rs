//! Hysteria2 子进程生命周期
//!
//! 每个节点 tag 一个子进程。停止先发 SIGTERM，5 秒不退再 SIGKILL。
//! 子进程的标准输出/错误转进结构化日志，异常退出只记日志，节点
//! 保持注册，下一次用户变更触发重启。

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 优雅退出的宽限期
const STOP_GRACE: Duration = Duration::from_secs(5);
/// 重启间隔，给端口释放留一点时间
const RESTART_DELAY: Duration = Duration::from_millis(100);

pub struct ProcessHandle {
    tag: String,
    binary: PathBuf,
    config_path: PathBuf,
    child: Mutex<Option<Child>>,
    running: Arc<AtomicBool>,
    pid: AtomicI32,
}

impl ProcessHandle {
    pub fn new(tag: &str, binary: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            tag: tag.to_string(),
            binary: binary.into(),
            config_path: config_path.into(),
            child: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            pid: AtomicI32::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> Option<i32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_some() && self.is_running() {
            anyhow::bail!("process already running for {}", self.tag);
        }
        if !self.binary.exists() {
            anyhow::bail!("hysteria2 binary not found at {}", self.binary.display());
        }
        if !self.config_path.exists() {
            anyhow::bail!("config file not found at {}", self.config_path.display());
        }

        let mut child = Command::new(&self.binary)
            .arg("server")
            .arg("-c")
            .arg(&self.config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", self.binary.display()))?;

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        self.pid.store(pid, Ordering::Release);
        self.running.store(true, Ordering::Release);

        if let Some(stdout) = child.stdout.take() {
            forward_output(self.tag.clone(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.tag.clone(), stderr, true);
        }

        *slot = Some(child);
        info!(
            tag = self.tag.as_str(),
            pid = pid,
            config = %self.config_path.display(),
            "hysteria2 process started"
        );
        Ok(())
    }

    /// TERM → 等 5 秒 → KILL
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return Ok(());
        };

        let pid = self.pid.swap(0, Ordering::AcqRel);
        if pid > 0 {
            // 先礼后兵
            let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
            if ret != 0 {
                warn!(tag = self.tag.as_str(), pid = pid, "SIGTERM failed, killing");
                let _ = child.start_kill();
            }
        } else {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(status) => {
                debug!(tag = self.tag.as_str(), status = ?status.ok(), "process exited");
            }
            Err(_) => {
                warn!(tag = self.tag.as_str(), "process did not exit in time, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        self.running.store(false, Ordering::Release);
        info!(tag = self.tag.as_str(), "hysteria2 process stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        tokio::time::sleep(RESTART_DELAY).await;
        self.start().await
    }

    /// 收割已退出的子进程并更新状态。异常退出只告警。
    pub async fn reap_if_exited(&self) {
        let mut slot = self.child.lock().await;
        let Some(child) = slot.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    info!(tag = self.tag.as_str(), "hysteria2 process exited");
                } else {
                    warn!(tag = self.tag.as_str(), status = %status, "hysteria2 process exited abnormally");
                }
                *slot = None;
                self.pid.store(0, Ordering::Release);
                self.running.store(false, Ordering::Release);
            }
            Ok(None) => {}
            Err(e) => {
                error!(tag = self.tag.as_str(), error = %e, "failed to poll child status");
            }
        }
    }
}

/// 子进程输出按行转进日志，stderr 走 error 级
fn forward_output(
    tag: String,
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    is_stderr: bool,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            if is_stderr {
                error!(hy2 = tag.as_str(), "{}", line);
            } else {
                debug!(hy2 = tag.as_str(), "{}", line);
            }
        }
    });
}
