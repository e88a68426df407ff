//! Job submission: authenticate, prepare-upload, upload.
//!
//! The three calls run strictly in sequence because each consumes the
//! previous response's signature and timestamp. A transient failure with
//! offline mode enabled parks the job in `failed_offline` and reports a
//! degraded success; the images stay on disk for a later resubmission.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::api::{
    ApiError, ApiResponse, AuthRequest, PrepUploadRequest, SelfieApi, UploadFile, UploadPackage,
    RETRY_WITH_FLAG_CODE,
};
use crate::config::CaptureConfig;
use crate::error::{ArtifactError, SubmissionError};
use crate::job::{ArtifactKind, ArtifactRef, FailureReason, JobManifest, Lifecycle};
use crate::store::ArtifactStore;

/// What to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRequest {
    pub job_id: String,
    pub user_id: String,
    pub failure_reason: Option<FailureReason>,
    /// Number of liveness frames a complete job carries.
    pub expected_liveness: usize,
    /// Liveness captures that produced no file. Any is fatal.
    pub missing_liveness: usize,
}

/// Artifact references after a submission attempt settled.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedArtifacts {
    pub selfie: ArtifactRef,
    pub liveness: Vec<ArtifactRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// Uploaded; the job now lives under `submitted`.
    Submitted {
        artifacts: SubmittedArtifacts,
        response: ApiResponse,
    },
    /// Accepted locally, pending upload; the job lives under `failed_offline`.
    QueuedOffline {
        artifacts: SubmittedArtifacts,
        reason: String,
    },
}

impl SubmissionOutcome {
    pub fn artifacts(&self) -> &SubmittedArtifacts {
        match self {
            SubmissionOutcome::Submitted { artifacts, .. }
            | SubmissionOutcome::QueuedOffline { artifacts, .. } => artifacts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SubmissionSettings {
    offline_mode: bool,
    allow_partial_on_timeout: bool,
    allow_new_enroll: bool,
    callback_url: Option<String>,
}

/// Single-flight submitter. Cheap to clone; clones share the in-flight set.
#[derive(Clone)]
pub struct SubmissionManager {
    api: Arc<dyn SelfieApi>,
    store: ArtifactStore,
    settings: SubmissionSettings,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SubmissionManager {
    pub fn new(api: Arc<dyn SelfieApi>, store: ArtifactStore, config: &CaptureConfig) -> Self {
        Self {
            api,
            store,
            settings: SubmissionSettings {
                offline_mode: config.offline_mode,
                allow_partial_on_timeout: config.allow_partial_on_timeout,
                allow_new_enroll: config.allow_new_enroll,
                callback_url: config.callback_url.clone(),
            },
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        lock(&self.in_flight).contains(job_id)
    }

    /// Submit a pending job. A concurrent call for the same job id fails with
    /// [`SubmissionError::InProgress`]. Dropping the future releases the job.
    pub async fn submit(
        &self,
        request: &SubmissionRequest,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let _guard = InFlightGuard::acquire(&self.in_flight, &request.job_id)?;
        self.run(request).await
    }

    /// Submit a job again from its `manifest.json`, returning it from
    /// `failed_offline` to pending first. The manifest's digests must still
    /// match the files on disk.
    pub async fn resubmit(&self, job_id: &str) -> Result<SubmissionOutcome, SubmissionError> {
        let _guard = InFlightGuard::acquire(&self.in_flight, job_id)?;
        let manifest = self
            .store
            .verify_job(job_id)
            .map_err(|source| SubmissionError::Incomplete {
                job_id: job_id.to_string(),
                source,
            })?;
        if self.store.locate(job_id) == Some(Lifecycle::FailedOffline) {
            self.store.requeue(job_id)?;
        }
        tracing::info!(job_id, "resubmitting job from manifest");

        let expected_liveness = manifest.count(ArtifactKind::Liveness);
        let request = SubmissionRequest {
            job_id: job_id.to_string(),
            user_id: manifest.user_id,
            failure_reason: manifest.failure_reason,
            expected_liveness,
            missing_liveness: 0,
        };
        self.run(&request).await
    }

    async fn run(&self, request: &SubmissionRequest) -> Result<SubmissionOutcome, SubmissionError> {
        let job_id = request.job_id.as_str();
        tracing::info!(job_id, failure_reason = ?request.failure_reason, "submission started");

        let (selfie, liveness) = self.check_complete(request)?;

        let template = JobManifest {
            job_id: job_id.to_string(),
            user_id: request.user_id.clone(),
            created_at: Utc::now(),
            failure_reason: request.failure_reason,
            allow_new_enroll: self.settings.allow_new_enroll,
            callback_url: self.settings.callback_url.clone(),
            partner_params: BTreeMap::new(),
            artifacts: Vec::new(),
        };
        let manifest = self.store.build_manifest(job_id, template)?;
        if self.settings.offline_mode {
            // Durable before the first network call.
            self.store.write_manifest(&manifest)?;
        }
        let mut package = self.package(manifest, &selfie, &liveness)?;

        match self.run_calls(request, &mut package).await {
            Ok(response) => {
                self.store.write_manifest(&package.manifest)?;
                self.store.move_to_submitted(job_id)?;
                tracing::info!(job_id, ref_id = %response.ref_id, "submission complete");
                Ok(SubmissionOutcome::Submitted {
                    artifacts: relocate(&selfie, &liveness, Lifecycle::Submitted),
                    response,
                })
            }
            Err(SubmissionError::Network(reason)) if self.settings.offline_mode => {
                self.store.write_manifest(&package.manifest)?;
                self.store.move_to_failed_offline(job_id)?;
                tracing::warn!(job_id, %reason, "network unavailable; job queued offline");
                Ok(SubmissionOutcome::QueuedOffline {
                    artifacts: relocate(&selfie, &liveness, Lifecycle::FailedOffline),
                    reason,
                })
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, retryable = e.is_retryable(), "submission failed");
                Err(e)
            }
        }
    }

    fn check_complete(
        &self,
        request: &SubmissionRequest,
    ) -> Result<(ArtifactRef, Vec<ArtifactRef>), SubmissionError> {
        let job_id = request.job_id.as_str();
        let incomplete = |source| SubmissionError::Incomplete {
            job_id: job_id.to_string(),
            source,
        };

        if self.store.locate(job_id) != Some(Lifecycle::Pending) {
            return Err(incomplete(ArtifactError::JobNotFound(job_id.to_string())));
        }
        if request.missing_liveness > 0 {
            return Err(incomplete(ArtifactError::MissingArtifact(format!(
                "{} liveness frame(s) captured without a usable image",
                request.missing_liveness
            ))));
        }

        let selfie = self
            .store
            .list_by_type(job_id, ArtifactKind::Selfie, false)?
            .into_iter()
            .next()
            .ok_or_else(|| incomplete(ArtifactError::MissingArtifact("selfie".to_string())))?;

        let liveness = self.store.list_by_type(job_id, ArtifactKind::Liveness, false)?;
        let partial_allowed = self.settings.allow_partial_on_timeout
            && request.failure_reason == Some(FailureReason::ActiveLivenessTimedOut)
            && liveness.len() < request.expected_liveness;
        if liveness.len() != request.expected_liveness && !partial_allowed {
            return Err(incomplete(ArtifactError::CountMismatch {
                expected: request.expected_liveness,
                actual: liveness.len(),
            }));
        }
        if partial_allowed {
            tracing::warn!(
                job_id,
                expected = request.expected_liveness,
                actual = liveness.len(),
                "submitting partial liveness set after timeout"
            );
        }

        Ok((selfie, liveness))
    }

    fn package(
        &self,
        manifest: JobManifest,
        selfie: &ArtifactRef,
        liveness: &[ArtifactRef],
    ) -> Result<UploadPackage, ArtifactError> {
        let mut files = Vec::with_capacity(liveness.len() + 1);
        for artifact in std::iter::once(selfie).chain(liveness) {
            files.push(UploadFile {
                file_name: artifact.file_name.clone(),
                kind: artifact.kind,
                bytes: self.store.read(artifact)?,
            });
        }
        Ok(UploadPackage { manifest, files })
    }

    async fn run_calls(
        &self,
        request: &SubmissionRequest,
        package: &mut UploadPackage,
    ) -> Result<ApiResponse, SubmissionError> {
        let auth = self
            .api
            .authenticate(&AuthRequest {
                job_id: request.job_id.clone(),
                user_id: request.user_id.clone(),
            })
            .await?;
        if !auth.success {
            return Err(SubmissionError::Permanent {
                code: "auth_failed".to_string(),
                message: "authentication was not accepted".to_string(),
            });
        }
        tracing::debug!(job_id = %request.job_id, "authenticated");
        package.manifest.partner_params = auth.partner_params.clone();

        let mut prep_request = PrepUploadRequest {
            job_id: request.job_id.clone(),
            signature: auth.signature,
            timestamp: auth.timestamp,
            partner_params: auth.partner_params,
            callback_url: self.settings.callback_url.clone(),
            allow_new_enroll: self.settings.allow_new_enroll,
            retry: false,
        };
        let prep = match self.api.prepare_upload(&prep_request).await {
            Err(ApiError::Rejected { code, .. }) if code == RETRY_WITH_FLAG_CODE => {
                tracing::info!(job_id = %request.job_id, code = %code, "prepare-upload asked for retry");
                prep_request.retry = true;
                self.api.prepare_upload(&prep_request).await?
            }
            other => other?,
        };
        tracing::debug!(job_id = %request.job_id, ref_id = %prep.ref_id, "upload prepared");

        let ack = self.api.upload(&prep.upload_url, package).await?;

        Ok(ApiResponse {
            ref_id: prep.ref_id,
            code: prep.code,
            upload_status: ack.status,
        })
    }
}

fn relocate(selfie: &ArtifactRef, liveness: &[ArtifactRef], to: Lifecycle) -> SubmittedArtifacts {
    SubmittedArtifacts {
        selfie: selfie.in_lifecycle(to),
        liveness: liveness.iter().map(|a| a.in_lifecycle(to)).collect(),
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a job as in flight until dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, job_id: &str) -> Result<Self, SubmissionError> {
        if !lock(set).insert(job_id.to_string()) {
            tracing::warn!(job_id, "submission rejected: already in progress");
            return Err(SubmissionError::InProgress(job_id.to_string()));
        }
        Ok(Self {
            set: Arc::clone(set),
            job_id: job_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockApi;

    fn setup(
        api: Arc<MockApi>,
        offline_mode: bool,
    ) -> (tempfile::TempDir, SubmissionManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let config = CaptureConfig {
            offline_mode,
            ..CaptureConfig::default()
        };
        (dir, SubmissionManager::new(api, store, &config))
    }

    fn seed(store: &ArtifactStore, job_id: &str, liveness: usize) {
        store.save(job_id, ArtifactKind::Selfie, b"selfie").unwrap();
        for i in 0..liveness {
            store
                .save(job_id, ArtifactKind::Liveness, format!("frame-{i}").as_bytes())
                .unwrap();
        }
    }

    fn request(job_id: &str, expected: usize, reason: Option<FailureReason>) -> SubmissionRequest {
        SubmissionRequest {
            job_id: job_id.to_string(),
            user_id: "user-1".to_string(),
            failure_reason: reason,
            expected_liveness: expected,
            missing_liveness: 0,
        }
    }

    #[tokio::test]
    async fn test_success_moves_job_to_submitted() {
        let api = Arc::new(MockApi::default());
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-1", 3);

        let outcome = mgr.submit(&request("job-1", 3, None)).await.unwrap();
        let SubmissionOutcome::Submitted { artifacts, response } = outcome else {
            panic!("expected Submitted");
        };
        assert_eq!(response.ref_id, "ref-job-1");
        assert_eq!(artifacts.selfie.lifecycle, Lifecycle::Submitted);
        assert_eq!(artifacts.liveness.len(), 3);
        assert_eq!(mgr.store().locate("job-1"), Some(Lifecycle::Submitted));
        assert_eq!(
            mgr.store().read(&artifacts.liveness[1]).unwrap(),
            b"frame-1".to_vec()
        );
        assert_eq!(api.calls(), vec!["authenticate", "prepare_upload", "upload"]);
        assert_eq!(api.uploaded_files(), 4);
        assert!(mgr.store().verify_job("job-1").is_ok());
        assert!(!mgr.is_in_flight("job-1"));
    }

    #[tokio::test]
    async fn test_signature_propagates_to_prepare_upload() {
        let api = Arc::new(MockApi::default());
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-sig", 3);

        mgr.submit(&request("job-sig", 3, None)).await.unwrap();
        let prep = api.prep_requests();
        assert_eq!(prep.len(), 1);
        assert_eq!(prep[0].signature, "sig-job-sig");
        assert_eq!(prep[0].timestamp, "ts-job-sig");
        assert!(!prep[0].retry);
    }

    #[tokio::test]
    async fn test_retry_code_reissues_prepare_upload_once() {
        let api = Arc::new(MockApi::default());
        api.push_prep_error(ApiError::Rejected {
            code: RETRY_WITH_FLAG_CODE.to_string(),
            message: "duplicate".to_string(),
        });
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-2", 3);

        mgr.submit(&request("job-2", 3, None)).await.unwrap();
        let prep = api.prep_requests();
        assert_eq!(prep.len(), 2);
        assert!(!prep[0].retry);
        assert!(prep[1].retry);
    }

    #[tokio::test]
    async fn test_retry_is_not_looped() {
        let api = Arc::new(MockApi::default());
        for _ in 0..2 {
            api.push_prep_error(ApiError::Rejected {
                code: RETRY_WITH_FLAG_CODE.to_string(),
                message: "duplicate".to_string(),
            });
        }
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-3", 3);

        let err = mgr.submit(&request("job-3", 3, None)).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Permanent { ref code, .. } if code == "2215"));
        assert_eq!(api.prep_requests().len(), 2);
        assert_eq!(mgr.store().locate("job-3"), Some(Lifecycle::Pending));
    }

    #[tokio::test]
    async fn test_transient_failure_queues_offline() {
        let api = Arc::new(MockApi::default());
        api.fail_upload(ApiError::Network("connection reset".to_string()));
        let (_dir, mgr) = setup(api.clone(), true);
        seed(mgr.store(), "job-4", 3);

        let outcome = mgr.submit(&request("job-4", 3, None)).await.unwrap();
        assert!(matches!(outcome, SubmissionOutcome::QueuedOffline { .. }));
        assert_eq!(
            outcome.artifacts().selfie.lifecycle,
            Lifecycle::FailedOffline
        );
        assert_eq!(mgr.store().locate("job-4"), Some(Lifecycle::FailedOffline));
        // The job record was persisted and is intact.
        let manifest = mgr.store().verify_job("job-4").unwrap();
        assert_eq!(manifest.count(ArtifactKind::Liveness), 3);
    }

    #[tokio::test]
    async fn test_offline_record_written_before_network() {
        let api = Arc::new(MockApi::default());
        api.fail_auth(ApiError::Network("offline".to_string()));
        let (dir, mgr) = setup(api.clone(), true);
        seed(mgr.store(), "job-5", 3);
        api.expect_manifest_at(dir.path().join("pending/job-5/manifest.json"));

        mgr.submit(&request("job-5", 3, None)).await.unwrap();
        assert_eq!(api.manifest_seen(), Some(true));
    }

    #[tokio::test]
    async fn test_transient_failure_without_offline_mode_is_retryable() {
        let api = Arc::new(MockApi::default());
        api.fail_auth(ApiError::Timeout("auth".to_string()));
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-6", 3);

        let err = mgr.submit(&request("job-6", 3, None)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(mgr.store().locate("job-6"), Some(Lifecycle::Pending));
        assert_eq!(api.calls(), vec!["authenticate"]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_hard_error() {
        let api = Arc::new(MockApi::default());
        api.fail_upload(ApiError::Rejected {
            code: "2204".to_string(),
            message: "invalid image".to_string(),
        });
        let (_dir, mgr) = setup(api.clone(), true);
        seed(mgr.store(), "job-7", 3);

        let err = mgr.submit(&request("job-7", 3, None)).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Permanent { ref code, .. } if code == "2204"));
        assert!(!err.is_retryable());
        assert_eq!(mgr.store().locate("job-7"), Some(Lifecycle::Pending));
    }

    #[tokio::test]
    async fn test_count_mismatch_is_fatal() {
        let api = Arc::new(MockApi::default());
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-8", 2);

        let err = mgr.submit(&request("job-8", 3, None)).await.unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::Incomplete {
                source: ArtifactError::CountMismatch {
                    expected: 3,
                    actual: 2
                },
                ..
            }
        ));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_too_many_frames_is_fatal_even_after_timeout() {
        let api = Arc::new(MockApi::default());
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-9", 4);

        let err = mgr
            .submit(&request(
                "job-9",
                3,
                Some(FailureReason::ActiveLivenessTimedOut),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Incomplete { .. }));
    }

    #[tokio::test]
    async fn test_partial_set_accepted_after_timeout() {
        let api = Arc::new(MockApi::default());
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-10", 2);

        let outcome = mgr
            .submit(&request(
                "job-10",
                3,
                Some(FailureReason::ActiveLivenessTimedOut),
            ))
            .await
            .unwrap();
        assert_eq!(outcome.artifacts().liveness.len(), 2);
        let manifest = mgr.store().read_manifest("job-10").unwrap();
        assert_eq!(
            manifest.failure_reason,
            Some(FailureReason::ActiveLivenessTimedOut)
        );
    }

    #[tokio::test]
    async fn test_missing_frames_are_fatal_even_after_timeout() {
        let api = Arc::new(MockApi::default());
        let (_dir, mgr) = setup(api.clone(), true);
        seed(mgr.store(), "job-14", 1);

        let req = SubmissionRequest {
            missing_liveness: 2,
            ..request("job-14", 3, Some(FailureReason::ActiveLivenessTimedOut))
        };
        let err = mgr.submit(&req).await.unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::Incomplete {
                source: ArtifactError::MissingArtifact(_),
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert!(api.calls().is_empty());
        assert_eq!(mgr.store().locate("job-14"), Some(Lifecycle::Pending));
        assert!(mgr.store().read_manifest("job-14").is_err());
    }

    #[tokio::test]
    async fn test_partner_params_recorded_in_manifest() {
        let api = Arc::new(MockApi::default());
        api.set_partner_params(BTreeMap::from([("job_type".to_string(), "6".to_string())]));
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-15", 3);

        mgr.submit(&request("job-15", 3, None)).await.unwrap();
        let manifest = mgr.store().read_manifest("job-15").unwrap();
        assert_eq!(manifest.partner_params.get("job_type").map(String::as_str), Some("6"));
        assert_eq!(api.prep_requests()[0].partner_params, manifest.partner_params);
    }

    #[tokio::test]
    async fn test_offline_job_resubmits_from_manifest() {
        let api = Arc::new(MockApi::default());
        api.set_partner_params(BTreeMap::from([("job_type".to_string(), "6".to_string())]));
        api.fail_upload(ApiError::Network("connection reset".to_string()));
        let (_dir, mgr) = setup(api.clone(), true);
        seed(mgr.store(), "job-16", 2);

        let outcome = mgr
            .submit(&request(
                "job-16",
                3,
                Some(FailureReason::ActiveLivenessTimedOut),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmissionOutcome::QueuedOffline { .. }));
        let queued = mgr.store().read_manifest("job-16").unwrap();
        assert_eq!(queued.partner_params.len(), 1);

        api.recover();
        let outcome = mgr.resubmit("job-16").await.unwrap();
        let SubmissionOutcome::Submitted { artifacts, .. } = outcome else {
            panic!("expected Submitted");
        };
        assert_eq!(artifacts.liveness.len(), 2);
        assert_eq!(mgr.store().locate("job-16"), Some(Lifecycle::Submitted));
        let manifest = mgr.store().verify_job("job-16").unwrap();
        assert_eq!(manifest.user_id, "user-1");
        assert_eq!(
            manifest.failure_reason,
            Some(FailureReason::ActiveLivenessTimedOut)
        );
        assert_eq!(api.uploaded_files(), 3);
    }

    #[tokio::test]
    async fn test_resubmit_rejects_tampered_job() {
        let api = Arc::new(MockApi::default());
        api.fail_auth(ApiError::Network("offline".to_string()));
        let (_dir, mgr) = setup(api.clone(), true);
        seed(mgr.store(), "job-17", 3);
        mgr.submit(&request("job-17", 3, None)).await.unwrap();

        let frame = mgr
            .store()
            .job_dir("job-17", Lifecycle::FailedOffline)
            .join("liveness_01.jpg");
        std::fs::write(frame, b"swapped").unwrap();

        api.recover();
        let err = mgr.resubmit("job-17").await.unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::Incomplete {
                source: ArtifactError::DigestMismatch { .. },
                ..
            }
        ));
        assert_eq!(mgr.store().locate("job-17"), Some(Lifecycle::FailedOffline));
        assert!(!mgr.is_in_flight("job-17"));
    }

    #[tokio::test]
    async fn test_missing_selfie_is_fatal() {
        let api = Arc::new(MockApi::default());
        let (_dir, mgr) = setup(api.clone(), false);
        for _ in 0..3 {
            mgr.store()
                .save("job-11", ArtifactKind::Liveness, b"f")
                .unwrap();
        }
        let err = mgr.submit(&request("job-11", 3, None)).await.unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::Incomplete {
                source: ArtifactError::MissingArtifact(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_submit_rejected() {
        let api = Arc::new(MockApi::default());
        let release = api.gate_authenticate();
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-12", 3);

        let first = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.submit(&request("job-12", 3, None)).await })
        };
        while !mgr.is_in_flight("job-12") {
            tokio::task::yield_now().await;
        }

        let second = mgr.submit(&request("job-12", 3, None)).await;
        assert!(matches!(second, Err(SubmissionError::InProgress(ref id)) if id == "job-12"));

        release.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Submitted { .. }));
        assert!(!mgr.is_in_flight("job-12"));
    }

    #[tokio::test]
    async fn test_cancelled_submission_releases_job() {
        let api = Arc::new(MockApi::default());
        let _release = api.gate_authenticate();
        let (_dir, mgr) = setup(api.clone(), false);
        seed(mgr.store(), "job-13", 3);

        let task = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.submit(&request("job-13", 3, None)).await })
        };
        while !mgr.is_in_flight("job-13") {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(!mgr.is_in_flight("job-13"));
        assert_eq!(mgr.store().locate("job-13"), Some(Lifecycle::Pending));
        assert_eq!(
            mgr.store()
                .list_by_type("job-13", ArtifactKind::Liveness, false)
                .unwrap()
                .len(),
            3
        );
    }
}
