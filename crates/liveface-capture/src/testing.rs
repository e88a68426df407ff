//! Scriptable backend and capabilities for unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use liveface_core::{
    DetectionError, FaceGeometry, FaceGeometryProvider, ImageFrame, LayoutFrame,
    QualityClassifier, QualityError, Rect,
};

use crate::api::{
    ApiError, AuthRequest, AuthResponse, PrepUploadRequest, PrepUploadResponse, SelfieApi,
    UploadAck, UploadPackage,
};

#[derive(Default)]
struct MockState {
    calls: Vec<&'static str>,
    auth_error: Option<ApiError>,
    prep_errors: VecDeque<ApiError>,
    prep_requests: Vec<PrepUploadRequest>,
    upload_error: Option<ApiError>,
    uploaded_files: usize,
    auth_gate: Option<Arc<Notify>>,
    partner_params: BTreeMap<String, String>,
    manifest_path: Option<PathBuf>,
    manifest_seen: Option<bool>,
}

/// Backend that succeeds unless told otherwise.
#[derive(Default)]
pub struct MockApi {
    state: Mutex<MockState>,
}

impl MockApi {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn prep_requests(&self) -> Vec<PrepUploadRequest> {
        self.state().prep_requests.clone()
    }

    pub fn uploaded_files(&self) -> usize {
        self.state().uploaded_files
    }

    pub fn fail_auth(&self, error: ApiError) {
        self.state().auth_error = Some(error);
    }

    /// Clear scripted auth and upload failures.
    pub fn recover(&self) {
        let mut state = self.state();
        state.auth_error = None;
        state.upload_error = None;
    }

    pub fn set_partner_params(&self, params: BTreeMap<String, String>) {
        self.state().partner_params = params;
    }

    pub fn push_prep_error(&self, error: ApiError) {
        self.state().prep_errors.push_back(error);
    }

    pub fn fail_upload(&self, error: ApiError) {
        self.state().upload_error = Some(error);
    }

    /// Hold `authenticate` until the returned handle is notified.
    pub fn gate_authenticate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().auth_gate = Some(gate.clone());
        gate
    }

    /// Record whether `path` exists when `authenticate` is first called.
    pub fn expect_manifest_at(&self, path: PathBuf) {
        self.state().manifest_path = Some(path);
    }

    pub fn manifest_seen(&self) -> Option<bool> {
        self.state().manifest_seen
    }
}

#[async_trait]
impl SelfieApi for MockApi {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResponse, ApiError> {
        let gate = {
            let mut state = self.state();
            state.calls.push("authenticate");
            if let Some(path) = state.manifest_path.clone() {
                state.manifest_seen = Some(path.exists());
            }
            state.auth_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let state = self.state();
        if let Some(e) = state.auth_error.clone() {
            return Err(e);
        }
        Ok(AuthResponse {
            success: true,
            signature: format!("sig-{}", request.job_id),
            timestamp: format!("ts-{}", request.job_id),
            partner_params: state.partner_params.clone(),
        })
    }

    async fn prepare_upload(
        &self,
        request: &PrepUploadRequest,
    ) -> Result<PrepUploadResponse, ApiError> {
        let mut state = self.state();
        state.calls.push("prepare_upload");
        state.prep_requests.push(request.clone());
        if let Some(e) = state.prep_errors.pop_front() {
            return Err(e);
        }
        Ok(PrepUploadResponse {
            code: "2202".to_string(),
            ref_id: format!("ref-{}", request.job_id),
            upload_url: format!("https://upload.test/{}", request.job_id),
        })
    }

    async fn upload(&self, _url: &str, package: &UploadPackage) -> Result<UploadAck, ApiError> {
        let mut state = self.state();
        state.calls.push("upload");
        if let Some(e) = state.upload_error.clone() {
            return Err(e);
        }
        state.uploaded_files = package.files.len();
        Ok(UploadAck { status: 200 })
    }
}

/// Detector that reports whatever geometry was last scripted.
pub struct ScriptedProvider {
    next: Mutex<Result<FaceGeometry, DetectionError>>,
}

impl ScriptedProvider {
    pub fn new(initial: Result<FaceGeometry, DetectionError>) -> Self {
        Self {
            next: Mutex::new(initial),
        }
    }

    pub fn set(&self, result: Result<FaceGeometry, DetectionError>) {
        *self.next.lock().unwrap() = result;
    }
}

impl FaceGeometryProvider for ScriptedProvider {
    fn analyze(&self, _image: &ImageFrame) -> Result<FaceGeometry, DetectionError> {
        self.next.lock().unwrap().clone()
    }
}

pub struct FixedQuality(pub f32);

impl QualityClassifier for FixedQuality {
    fn score(&self, _image: &ImageFrame) -> Result<f32, QualityError> {
        Ok(self.0)
    }
}

/// A well-sized face centred in the default guide, at the given pose.
pub fn centered_face(yaw: f32, pitch: f32) -> FaceGeometry {
    let layout = LayoutFrame::default();
    let (gx, gy) = layout.guide.center();
    let (w, h) = (220.0, 280.0);
    FaceGeometry {
        bounding_box: Rect::new(
            (gx - w / 2.0) / layout.view_width,
            (gy - h / 2.0) / layout.view_height,
            w / layout.view_width,
            h / layout.view_height,
        ),
        roll: 0.0,
        pitch,
        yaw,
        quality_score: 0.9,
        brightness: 120,
    }
}
