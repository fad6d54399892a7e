use common::Result;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 分片最长保留时间
pub const SEGMENT_MAX_AGE: Duration = Duration::from_secs(5 * 60);
/// 清理周期
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// 删除目录中修改时间早于 `max_age` 的 `.ts` 分片，返回删除数量
///
/// 清单文件不在清理范围内；目录不存在时视为无事可做。
pub fn sweep_stale_segments(dir: &Path, max_age: Duration) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;

    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let is_segment = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("ts"))
            .unwrap_or(false);
        if !is_segment {
            continue;
        }

        let modified = match entry.metadata().map(|m| m.modified()) {
            Ok(Ok(modified)) => modified,
            Ok(Err(e)) => {
                warn!("Cannot read mtime of {:?}: {}", path, e);
                continue;
            }
            Err(e) => {
                warn!("Cannot stat {:?}: {}", path, e);
                continue;
            }
        };

        if modified < cutoff {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    debug!("Removed stale segment {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove stale segment {:?}: {}", path, e),
            }
        }
    }

    Ok(removed)
}

/// 周期性清理任务，取消令牌触发后退出
pub fn spawn_retention_sweep(
    dir: PathBuf,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        info!(
            "Segment retention started for {:?} (every {:?}, max age {:?})",
            dir, interval, max_age
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sweep_dir = dir.clone();
            match tokio::task::spawn_blocking(move || sweep_stale_segments(&sweep_dir, max_age)).await {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => info!("Removed {} stale HLS segments", removed),
                Ok(Err(e)) => warn!("Segment sweep failed: {}", e),
                Err(e) => warn!("Segment sweep task panicked: {}", e),
            }
        }

        info!("Segment retention stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn touch_with_age(dir: &Path, name: &str, age: Duration) {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    #[test]
    fn test_removes_only_segments_older_than_max_age() {
        let dir = tempfile::tempdir().unwrap();
        touch_with_age(dir.path(), "segment_001.ts", minutes(2));
        touch_with_age(dir.path(), "segment_002.ts", minutes(4));
        touch_with_age(dir.path(), "segment_003.ts", minutes(6));
        touch_with_age(dir.path(), "segment_004.ts", minutes(10));
        touch_with_age(dir.path(), "stream.m3u8", minutes(10));

        let removed = sweep_stale_segments(dir.path(), SEGMENT_MAX_AGE).unwrap();
        assert_eq!(removed, 2);

        assert!(dir.path().join("segment_001.ts").exists());
        assert!(dir.path().join("segment_002.ts").exists());
        assert!(!dir.path().join("segment_003.ts").exists());
        assert!(!dir.path().join("segment_004.ts").exists());
        assert!(dir.path().join("stream.m3u8").exists());
    }

    #[test]
    fn test_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let removed = sweep_stale_segments(&dir.path().join("hls"), SEGMENT_MAX_AGE).unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_periodic_sweep_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        touch_with_age(dir.path(), "segment_000.ts", minutes(10));

        let cancel = CancellationToken::new();
        let handle = spawn_retention_sweep(
            dir.path().to_path_buf(),
            Duration::from_millis(20),
            SEGMENT_MAX_AGE,
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while dir.path().join("segment_000.ts").exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
