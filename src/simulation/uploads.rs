//! Image upload scenario.
//!
//! Upload requests are size-checked, scanned by an external service,
//! thumbnailed with a blocking image step and then uploaded to the CDN.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CallError, ValidationError};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::stages::ItemHandler;
use crate::scheduler::job::WorkItem;

use super::plan::{CallPlan, PlannedResponse, SimTimings, SimulatedService};

/// Largest accepted upload.
pub const MAX_UPLOAD_MB: f64 = 25.0;

/// Base URL uploaded images are served from.
pub const CDN_BASE_URL: &str = "https://cdn.example.local";

/// Latencies of the upload scenario.
pub const UPLOAD_TIMINGS: SimTimings = SimTimings {
    ok_latency: Duration::from_millis(1400),
    error_latency: Duration::from_millis(1200),
    timeout_overshoot: Duration::from_millis(2200),
    blocking: Duration::from_millis(1300),
    finalize: Duration::from_millis(1500),
};

/// Pace at which sample requests arrive.
pub const UPLOAD_INGEST_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub user: String,
    pub size_mb: f64,
}

/// Result of the malware scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanVerdict {
    pub safe: bool,
}

pub struct UploadHandler {
    service: SimulatedService,
    flagged: HashSet<String>,
}

impl UploadHandler {
    pub fn new(timings: SimTimings, call_timeout: Duration) -> Self {
        Self {
            service: SimulatedService::new(timings, call_timeout),
            flagged: HashSet::new(),
        }
    }

    /// Sets the planned scan responses for `file_id`.
    pub fn with_plan(mut self, file_id: impl Into<String>, plan: CallPlan) -> Self {
        self.service.set_plan(file_id, plan);
        self
    }

    /// Makes the scan report `file_id` as unsafe.
    pub fn with_flagged(mut self, file_id: impl Into<String>) -> Self {
        self.flagged.insert(file_id.into());
        self
    }

    pub fn service(&self) -> &SimulatedService {
        &self.service
    }
}

#[async_trait]
impl ItemHandler for UploadHandler {
    type Payload = UploadRequest;
    type Response = ScanVerdict;
    type Artifact = String;

    fn validate(&self, item: &WorkItem<UploadRequest>) -> Result<(), ValidationError> {
        if item.payload.size_mb > MAX_UPLOAD_MB {
            return Err(ValidationError::new(format!(
                "file too large: {}MB",
                item.payload.size_mb
            )));
        }
        Ok(())
    }

    async fn call(
        &self,
        item: &WorkItem<UploadRequest>,
        attempt: u32,
    ) -> Result<ScanVerdict, CallError> {
        let safe = !self.flagged.contains(&item.id);
        self.service
            .respond(&item.id, attempt, "scan service temporary error", || {
                ScanVerdict { safe }
            })
            .await
    }

    fn blocking_step(
        &self,
        item: &WorkItem<UploadRequest>,
        verdict: ScanVerdict,
    ) -> anyhow::Result<String> {
        if !verdict.safe {
            anyhow::bail!("unsafe file detected");
        }
        std::thread::sleep(self.service.timings().blocking);
        Ok(format!("thumb_{}.jpg", item.id))
    }

    async fn finalize(
        &self,
        item: &WorkItem<UploadRequest>,
        thumbnail: String,
    ) -> anyhow::Result<String> {
        tokio::time::sleep(self.service.timings().finalize).await;
        let url = format!("{}/{}.jpg", CDN_BASE_URL, item.id);
        info!(item_id = %item.id, thumbnail = %thumbnail, url = %url, "Upload stored");
        Ok(url)
    }
}

/// Pipeline settings of the upload scenario.
pub fn upload_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_queue_capacity(3)
        .with_call_timeout(Duration::from_secs(3))
        .with_ingest_interval(UPLOAD_INGEST_INTERVAL)
}

/// The five sample requests, one of them oversized, and a handler primed
/// with their scan plans.
pub fn sample_uploads(
    timings: SimTimings,
    call_timeout: Duration,
) -> (UploadHandler, Vec<WorkItem<UploadRequest>>) {
    use PlannedResponse::{Error, Ok, Timeout};

    let requests: [(&str, &str, f64, Vec<PlannedResponse>); 5] = [
        ("IMG-001", "sato", 4.2, vec![Ok]),
        ("IMG-002", "tanaka", 7.8, vec![Timeout, Ok]),
        ("IMG-003", "suzuki", 3.1, vec![Error, Ok]),
        ("IMG-004", "yamada", 31.0, vec![Ok]),
        ("IMG-005", "ito", 5.5, vec![Ok]),
    ];

    let mut handler = UploadHandler::new(timings, call_timeout);
    let mut items = Vec::with_capacity(requests.len());
    for (id, user, size_mb, plan) in requests {
        handler = handler.with_plan(id, CallPlan::new(plan));
        items.push(WorkItem::new(
            id,
            UploadRequest {
                user: user.to_string(),
                size_mb,
            },
        ));
    }
    (handler, items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, size_mb: f64) -> WorkItem<UploadRequest> {
        WorkItem::new(
            id,
            UploadRequest {
                user: "sato".to_string(),
                size_mb,
            },
        )
    }

    #[test]
    fn test_size_limit() {
        let handler = UploadHandler::new(SimTimings::ZERO, Duration::from_millis(10));
        assert!(handler.validate(&request("a", 25.0)).is_ok());
        let err = handler.validate(&request("b", 31.0)).unwrap_err();
        assert_eq!(err.to_string(), "file too large: 31MB");
    }

    #[tokio::test]
    async fn test_flagged_file_fails_in_blocking_step() {
        let handler = UploadHandler::new(SimTimings::ZERO, Duration::from_millis(10))
            .with_flagged("IMG-666");
        let item = request("IMG-666", 1.0);

        let verdict = handler.call(&item, 1).await.unwrap();
        assert!(!verdict.safe);
        let err = handler.blocking_step(&item, verdict).unwrap_err();
        assert!(err.to_string().contains("unsafe"));
    }

    #[tokio::test]
    async fn test_thumbnail_and_upload() {
        let handler = UploadHandler::new(SimTimings::ZERO, Duration::from_millis(10));
        let item = request("IMG-001", 4.2);

        let thumb = handler
            .blocking_step(&item, ScanVerdict { safe: true })
            .unwrap();
        assert_eq!(thumb, "thumb_IMG-001.jpg");
        let url = handler.finalize(&item, thumb).await.unwrap();
        assert_eq!(url, "https://cdn.example.local/IMG-001.jpg");
    }

    #[test]
    fn test_sample_uploads() {
        let (handler, items) = sample_uploads(SimTimings::ZERO, Duration::from_secs(3));
        assert_eq!(items.len(), 5);
        let invalid: Vec<_> = items
            .iter()
            .filter(|item| handler.validate(item).is_err())
            .map(|item| item.id.as_str())
            .collect();
        assert_eq!(invalid, vec!["IMG-004"]);
    }

    #[test]
    fn test_upload_config() {
        let config = upload_config();
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }
}
