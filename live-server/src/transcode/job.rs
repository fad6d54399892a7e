use common::{LiveStreamError, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::HlsPolicy;

/// 停止时等待进程自行退出的时间
const STOP_GRACE: Duration = Duration::from_secs(5);

/// 转码进程的结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobExit {
    /// 进程在会话结束前自行退出
    Exited(Option<i32>),
    /// 收到停止信号后正常退出
    Stopped,
    /// 宽限期内未退出，被强制终止
    Killed,
    /// 等待进程状态失败
    Failed(String),
}

/// 一次转码任务
///
/// 生命周期严格包含在所属推流会话之内：`stop` 在每条拆除路径上调用一次，
/// 句柄被丢弃时也会取消监督任务，进程随之终止。
pub struct TranscodeJob {
    input_path: PathBuf,
    output_dir: PathBuf,
    segment_duration: u32,
    playlist_size: u32,
    pid: Option<u32>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<JobExit>>,
}

impl TranscodeJob {
    /// 启动进程并交给监督任务，不等待其完成
    pub fn spawn(
        mut command: Command,
        input_path: &Path,
        output_dir: &Path,
        policy: &HlsPolicy,
    ) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // 独立进程组，终端信号不会直接打到转码进程
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| LiveStreamError::ProcessFailure(format!("failed to spawn: {}", e)))?;
        let pid = child.id();
        info!("Transcoder started (pid: {:?}) for {:?}", pid, input_path);

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(child, cancel.clone()));

        Ok(Self {
            input_path: input_path.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            segment_duration: policy.segment_duration,
            playlist_size: policy.playlist_size,
            pid,
            cancel,
            supervisor: Some(supervisor),
        })
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn segment_duration(&self) -> u32 {
        self.segment_duration
    }

    pub fn playlist_size(&self) -> u32 {
        self.playlist_size
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// 取消令牌的克隆，用于观察任务是否已被停止
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 监督任务是否仍在运行
    pub fn is_running(&self) -> bool {
        self.supervisor
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// 停止转码，重复调用不会产生额外效果
    pub async fn stop(&mut self) -> Option<JobExit> {
        let supervisor = self.supervisor.take()?;
        self.cancel.cancel();

        match supervisor.await {
            Ok(exit) => {
                info!("Transcoder stopped: {:?}", exit);
                Some(exit)
            }
            Err(e) => {
                warn!("Transcoder supervisor task failed: {}", e);
                None
            }
        }
    }

    /// 发出停止信号并交出监督任务句柄，进程的退出由持有句柄的一方等待
    pub fn detach(&mut self) -> Option<JoinHandle<JobExit>> {
        self.cancel.cancel();
        self.supervisor.take()
    }
}

impl Drop for TranscodeJob {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise(mut child: Child, cancel: CancellationToken) -> JobExit {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                report_unexpected_exit(status);
                JobExit::Exited(status.code())
            }
            Err(e) => {
                error!("Failed to wait for transcoder: {}", e);
                JobExit::Failed(e.to_string())
            }
        },
        _ = cancel.cancelled() => shutdown(child).await,
    }
}

// 会话内不会自动重启，直到下一个会话HLS输出都是降级状态
fn report_unexpected_exit(status: ExitStatus) {
    if status.success() {
        warn!("Transcoder exited before the session ended");
    } else {
        error!("Transcoder process ended unexpectedly: {}", status);
    }
}

async fn shutdown(mut child: Child) -> JobExit {
    // ffmpeg在stdin收到q后会写完清单再退出
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(b"q").await {
            debug!("Transcoder stdin closed: {}", e);
        }
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Transcoder exited with {}", status);
            JobExit::Stopped
        }
        Ok(Err(e)) => JobExit::Failed(e.to_string()),
        Err(_) => {
            warn!("Transcoder did not exit within {:?}, killing", STOP_GRACE);
            kill_process_group(&child);
            if let Err(e) = child.kill().await {
                error!("Failed to kill transcoder: {}", e);
                return JobExit::Failed(e.to_string());
            }
            JobExit::Killed
        }
    }
}

// 进程以自身pid为组号启动，组内派生的子进程一并收到SIGKILL
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if rc != 0 {
        debug!(
            "Failed to signal process group {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}
