use common::{LiveStreamError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::AdmissionController;

/// 清单探测的超时时间
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// 清单探测
///
/// 对清单URL发一次GET，超时内返回2xx即认为可播放。结果不缓存。
#[derive(Clone)]
pub struct ManifestProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl ManifestProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, PROBE_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 探测一次，失败时给出原因
    pub async fn check(&self) -> Result<()> {
        let response = tokio::time::timeout(self.timeout, self.client.get(&self.url).send())
            .await
            .map_err(|_| LiveStreamError::Timeout(self.timeout))?
            .map_err(|e| LiveStreamError::ConnectionFailure(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LiveStreamError::ConnectionFailure(format!(
                "manifest returned {}",
                status
            )))
        }
    }

    pub async fn is_live(&self) -> bool {
        match self.check().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Manifest probe {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// 直播状态判定
///
/// 以准入状态为准：没有推流会话时一定不在直播。配置了清单探测时，
/// 还要求清单可以访问。
#[derive(Clone)]
pub struct LivenessProber {
    admission: Arc<AdmissionController>,
    probe: Option<ManifestProbe>,
}

impl LivenessProber {
    pub fn new(admission: Arc<AdmissionController>, probe: Option<ManifestProbe>) -> Self {
        Self { admission, probe }
    }

    pub async fn is_live(&self) -> bool {
        if !self.admission.is_live() {
            return false;
        }

        match &self.probe {
            Some(probe) => probe.is_live().await,
            None => true,
        }
    }
}
