use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::error::Result;
use crate::job::{StageJob, check_job_id};

const FILE_PREFIX: &str = "job-";
const FILE_SUFFIX: &str = ".json";

/// On-disk job descriptions for one stage runtime.
///
/// One file per tracked job, named from the job id. Files are written whole
/// (temp file + rename), so a reader never observes a partial document.
#[derive(Clone, Debug)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    /// Opens `dir`, creating it when missing.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: &str) -> Result<PathBuf> {
        check_job_id(job_id)?;
        Ok(self.dir.join(format!("{FILE_PREFIX}{job_id}{FILE_SUFFIX}")))
    }

    /// Writes the job description, replacing any previous version.
    pub async fn persist(&self, job: &StageJob) -> Result<PathBuf> {
        let path = self.path_for(&job.id)?;
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(job)?;
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &path).await?;
        debug!(job_id = %job.id, path = %path.display(), "job description persisted");
        Ok(path)
    }

    /// Removes the job description. Returns `false` when no file existed.
    pub async fn remove(&self, job_id: &str) -> Result<bool> {
        let path = self.path_for(job_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn load(&self, path: &Path) -> Result<StageJob> {
        let contents = fs::read(path).await?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Every readable job description in the directory, sorted by file name.
    /// Unreadable files are logged and skipped.
    pub async fn load_all(&self) -> Result<Vec<StageJob>> {
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_job_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX));
            if is_job_file {
                paths.push(path);
            }
        }
        paths.sort();

        let mut jobs = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load(&path).await {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable job file")
                }
            }
        }
        Ok(jobs)
    }
}
