use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::ArtifactError;
use crate::job::{ArtifactKind, ArtifactRef, JobManifest, Lifecycle, ManifestEntry};

const MANIFEST_FILE: &str = "manifest.json";

/// Filesystem-backed job store.
///
/// Layout: `{root}/{pending,submitted,failed_offline}/{job_id}/` holding
/// `selfie.jpg`, `liveness_NN.jpg` and `manifest.json`. Every file is written
/// to a `.part` sibling and renamed into place, and lifecycle transitions are
/// a single directory rename, so an interrupted write never leaves a
/// truncated artifact behind.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (or create) the store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, ArtifactError> {
        for lifecycle in Lifecycle::ALL {
            let dir = root.join(lifecycle.dir_name());
            fs::create_dir_all(&dir).map_err(|source| ArtifactError::Io { path: dir, source })?;
        }
        tracing::debug!(root = %root.display(), "artifact store opened");
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str, lifecycle: Lifecycle) -> PathBuf {
        self.root.join(lifecycle.dir_name()).join(job_id)
    }

    /// Absolute path of an artifact.
    pub fn resolve(&self, artifact: &ArtifactRef) -> PathBuf {
        self.root.join(artifact.relative_path())
    }

    /// Where a job currently lives, if anywhere.
    pub fn locate(&self, job_id: &str) -> Option<Lifecycle> {
        Lifecycle::ALL
            .into_iter()
            .find(|l| self.job_dir(job_id, *l).is_dir())
    }

    /// Persist an image for a pending job. Liveness frames are numbered in
    /// the order they are saved.
    pub fn save(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<ArtifactRef, ArtifactError> {
        validate_job_id(job_id)?;
        let dir = self.job_dir(job_id, Lifecycle::Pending);
        fs::create_dir_all(&dir).map_err(|source| ArtifactError::WriteFailed {
            path: dir.clone(),
            source,
        })?;

        let file_name = match kind {
            ArtifactKind::Selfie => "selfie.jpg".to_string(),
            ArtifactKind::Liveness => {
                let index = self.list_in(job_id, kind, Lifecycle::Pending)?.len();
                format!("liveness_{index:02}.jpg")
            }
        };

        write_atomic(&dir.join(&file_name), bytes)?;
        tracing::debug!(job_id, ?kind, file = %file_name, bytes = bytes.len(), "artifact saved");

        Ok(ArtifactRef {
            job_id: job_id.to_string(),
            kind,
            file_name,
            lifecycle: Lifecycle::Pending,
        })
    }

    /// Artifacts of one kind, sorted by file name. `submitted` selects the
    /// submitted directory, otherwise the pending one.
    pub fn list_by_type(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        submitted: bool,
    ) -> Result<Vec<ArtifactRef>, ArtifactError> {
        let lifecycle = if submitted {
            Lifecycle::Submitted
        } else {
            Lifecycle::Pending
        };
        self.list_in(job_id, kind, lifecycle)
    }

    /// Artifacts of one kind in a specific lifecycle directory.
    pub fn list_in(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        lifecycle: Lifecycle,
    ) -> Result<Vec<ArtifactRef>, ArtifactError> {
        validate_job_id(job_id)?;
        let dir = self.job_dir(job_id, lifecycle);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|source| ArtifactError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ArtifactError::Io {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if kind.matches(&name) {
                names.push(name);
            }
        }
        names.sort();

        Ok(names
            .into_iter()
            .map(|file_name| ArtifactRef {
                job_id: job_id.to_string(),
                kind,
                file_name,
                lifecycle,
            })
            .collect())
    }

    pub fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve(artifact);
        fs::read(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => {
                ArtifactError::MissingArtifact(artifact.relative_path().display().to_string())
            }
            _ => ArtifactError::Io { path, source },
        })
    }

    /// Build a manifest for a pending job from the files currently on disk.
    pub fn build_manifest(
        &self,
        job_id: &str,
        mut template: JobManifest,
    ) -> Result<JobManifest, ArtifactError> {
        let mut artifacts = Vec::new();
        for kind in [ArtifactKind::Selfie, ArtifactKind::Liveness] {
            for artifact in self.list_in(job_id, kind, Lifecycle::Pending)? {
                let bytes = self.read(&artifact)?;
                artifacts.push(ManifestEntry {
                    file_name: artifact.file_name,
                    kind,
                    sha256: sha256_hex(&bytes),
                });
            }
        }
        template.job_id = job_id.to_string();
        template.artifacts = artifacts;
        Ok(template)
    }

    /// Write `manifest.json` into the job's current directory. A job that no
    /// longer exists is not recreated.
    pub fn write_manifest(&self, manifest: &JobManifest) -> Result<(), ArtifactError> {
        validate_job_id(&manifest.job_id)?;
        let lifecycle = self
            .locate(&manifest.job_id)
            .ok_or_else(|| ArtifactError::JobNotFound(manifest.job_id.clone()))?;
        let dir = self.job_dir(&manifest.job_id, lifecycle);
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&dir.join(MANIFEST_FILE), &json)
    }

    pub fn read_manifest(&self, job_id: &str) -> Result<JobManifest, ArtifactError> {
        validate_job_id(job_id)?;
        let lifecycle = self
            .locate(job_id)
            .ok_or_else(|| ArtifactError::JobNotFound(job_id.to_string()))?;
        let path = self.job_dir(job_id, lifecycle).join(MANIFEST_FILE);
        let bytes = fs::read(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ArtifactError::MissingArtifact(format!(
                "{}/{job_id}/{MANIFEST_FILE}",
                lifecycle.dir_name()
            )),
            _ => ArtifactError::Io {
                path: path.clone(),
                source,
            },
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Re-hash every artifact listed in the manifest.
    pub fn verify_job(&self, job_id: &str) -> Result<JobManifest, ArtifactError> {
        let manifest = self.read_manifest(job_id)?;
        let lifecycle = self
            .locate(job_id)
            .ok_or_else(|| ArtifactError::JobNotFound(job_id.to_string()))?;
        for entry in &manifest.artifacts {
            let artifact = ArtifactRef {
                job_id: job_id.to_string(),
                kind: entry.kind,
                file_name: entry.file_name.clone(),
                lifecycle,
            };
            let digest = sha256_hex(&self.read(&artifact)?);
            if digest != entry.sha256 {
                return Err(ArtifactError::DigestMismatch {
                    file: entry.file_name.clone(),
                });
            }
        }
        Ok(manifest)
    }

    pub fn move_to_submitted(&self, job_id: &str) -> Result<(), ArtifactError> {
        self.transition(job_id, Lifecycle::Pending, Lifecycle::Submitted)
    }

    pub fn move_to_failed_offline(&self, job_id: &str) -> Result<(), ArtifactError> {
        self.transition(job_id, Lifecycle::Pending, Lifecycle::FailedOffline)
    }

    /// Return an offline-queued job to pending for resubmission.
    pub fn requeue(&self, job_id: &str) -> Result<(), ArtifactError> {
        self.transition(job_id, Lifecycle::FailedOffline, Lifecycle::Pending)
    }

    /// Remove a job from every lifecycle directory. Missing jobs are fine.
    pub fn delete(&self, job_id: &str) -> Result<(), ArtifactError> {
        validate_job_id(job_id)?;
        for lifecycle in Lifecycle::ALL {
            let dir = self.job_dir(job_id, lifecycle);
            match fs::remove_dir_all(&dir) {
                Ok(()) => tracing::info!(job_id, %lifecycle, "job deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(ArtifactError::Io { path: dir, source }),
            }
        }
        Ok(())
    }

    /// Job ids in one lifecycle directory, sorted.
    pub fn list_jobs(&self, lifecycle: Lifecycle) -> Result<Vec<String>, ArtifactError> {
        let dir = self.root.join(lifecycle.dir_name());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ArtifactError::Io { path: dir, source }),
        };
        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ArtifactError::Io {
                path: dir.clone(),
                source,
            })?;
            if entry.path().is_dir() {
                jobs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        jobs.sort();
        Ok(jobs)
    }

    fn transition(&self, job_id: &str, from: Lifecycle, to: Lifecycle) -> Result<(), ArtifactError> {
        validate_job_id(job_id)?;
        let src = self.job_dir(job_id, from);
        let dst = self.job_dir(job_id, to);
        if !src.is_dir() {
            return Err(ArtifactError::JobNotFound(job_id.to_string()));
        }
        if dst.exists() {
            // A stale copy from an earlier attempt; the source is authoritative.
            fs::remove_dir_all(&dst).map_err(|source| ArtifactError::Io {
                path: dst.clone(),
                source,
            })?;
        }
        fs::rename(&src, &dst).map_err(|source| ArtifactError::Io {
            path: src.clone(),
            source,
        })?;
        tracing::info!(job_id, %from, %to, "job moved");
        Ok(())
    }
}

/// Job ids become directory names; keep them to a safe character set.
fn validate_job_id(job_id: &str) -> Result<(), ArtifactError> {
    let ok = !job_id.is_empty()
        && job_id.len() <= 128
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ArtifactError::InvalidJobId(job_id.to_string()))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.part"));

    let write = || -> std::io::Result<()> {
        use std::io::Write;
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp_path, path)
    };

    write().map_err(|source| {
        fs::remove_file(&tmp_path).ok();
        ArtifactError::WriteFailed {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Hex SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
