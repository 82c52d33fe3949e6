//! Isolated worker environment for integration tests.
//!
//! A `TestHarness` owns a temporary directory holding the workspace roots, a
//! dataset bucket and an artifact bucket (both `LocalBlobStore`s), plus a
//! shell script standing in for the trainer. The job table is an in-memory
//! `MemoryJobTable` shared with the worker under test.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use lora_worker::blob::{BlobStore, LocalBlobStore};
use lora_worker::config::WorkerConfig;
use lora_worker::job::{JobId, JobLedger, LedgerSettings};
use lora_worker::layout::{JobLayout, WorkspacePaths};
use lora_worker::store::{ColumnNames, JobStoreClient, MemoryJobTable, Row};
use lora_worker::worker::{ensure_workspace, WorkerBackends, WorkerLoop};

use super::builders::WorkerConfigBuilder;

/// What the fake trainer does when invoked.
#[derive(Debug, Clone)]
pub enum TrainerBehavior {
    /// Writes an artifact of this many bytes and exits 0.
    Artifact(usize),
    /// Prints `line` and exits 0 without writing anything.
    PrintAndExit(String),
    /// Exits with this code without writing anything.
    ExitCode(i32),
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub table: Arc<MemoryJobTable>,
    pub config: WorkerConfig,
    pub paths: WorkspacePaths,
    pub dataset_root: PathBuf,
    /// `None` when artifacts stay on local disk.
    pub artifact_root: Option<PathBuf>,
}

impl TestHarness {
    /// Publishing harness with a trainer that writes a valid artifact.
    pub fn new() -> Self {
        Self::with_trainer(TrainerBehavior::Artifact(4096))
    }

    pub fn with_trainer(behavior: TrainerBehavior) -> Self {
        Self::build(MemoryJobTable::new(), behavior, true)
    }

    /// Artifacts are validated but never uploaded.
    pub fn local_only(behavior: TrainerBehavior) -> Self {
        Self::build(MemoryJobTable::new(), behavior, false)
    }

    /// The table accepts only `columns`, as after a schema change.
    pub fn with_columns(columns: &[&str], behavior: TrainerBehavior) -> Self {
        let table = MemoryJobTable::new().with_columns(columns.iter().copied());
        Self::build(table, behavior, true)
    }

    fn build(table: MemoryJobTable, behavior: TrainerBehavior, publish: bool) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let paths = WorkspacePaths::under(&base.join("workspace"));
        ensure_workspace(&paths).expect("Failed to create workspace");

        let dataset_root = base.join("datasets");
        let artifact_root = publish.then(|| base.join("artifacts"));
        let script = write_trainer(base, &behavior);

        let config = WorkerConfigBuilder::new()
            .paths(paths.clone())
            .trainer(script)
            .min_artifact_bytes(1024)
            .build();

        Self {
            temp_dir,
            table: Arc::new(table),
            config,
            paths,
            dataset_root,
            artifact_root,
        }
    }

    pub fn base(&self) -> &Path {
        self.temp_dir.path()
    }

    /// True once the fake trainer has been started at least once.
    pub fn trainer_ran(&self) -> bool {
        self.base().join("trainer_ran").exists()
    }

    /// Adds a queued job row.
    pub fn queue_job(&self, id: &str, owner: Option<&str>, created_at: &str) {
        self.insert_job(id, owner, "queued", created_at);
    }

    pub fn insert_job(&self, id: &str, owner: Option<&str>, status: &str, created_at: &str) {
        let mut row = json!({
            "id": id,
            "status": status,
            "progress": 0,
            "error_message": null,
            "created_at": created_at,
        });
        if let (Some(owner), Value::Object(map)) = (owner, &mut row) {
            map.insert("owner_id".into(), json!(owner));
        }
        self.table.insert(row);
    }

    /// Uploads `count` placeholder images for `job` to the dataset bucket.
    pub fn upload_images(&self, job: &str, count: usize) {
        let dir = self
            .dataset_root
            .join(&self.config.dataset.prefix_root)
            .join(job);
        std::fs::create_dir_all(&dir).expect("Failed to create dataset prefix");
        for i in 0..count {
            std::fs::write(dir.join(format!("img_{:02}.jpg", i)), b"jpeg")
                .expect("Failed to write image");
        }
    }

    pub fn row(&self, id: &str) -> Row {
        self.table
            .get(id)
            .unwrap_or_else(|| panic!("job {} not found", id))
    }

    pub fn status(&self, id: &str) -> String {
        self.row(id)["status"].as_str().unwrap_or_default().to_string()
    }

    pub fn layout(&self, id: &str) -> JobLayout {
        let id = JobId::parse(id).expect("valid job id");
        JobLayout::for_job(&self.paths, &id)
    }

    pub fn ledger(&self) -> Arc<JobLedger> {
        let client = JobStoreClient::new(self.table.clone(), ColumnNames::default(), 5);
        Arc::new(JobLedger::new(Arc::new(client), LedgerSettings::default()))
    }

    pub fn backends(&self) -> WorkerBackends {
        WorkerBackends {
            table: self.table.clone(),
            dataset_blobs: Arc::new(LocalBlobStore::new(&self.dataset_root)),
            artifact_blobs: self
                .artifact_root
                .as_ref()
                .map(|root| Arc::new(LocalBlobStore::new(root)) as Arc<dyn BlobStore>),
        }
    }

    pub fn worker(&self) -> WorkerLoop {
        WorkerLoop::new(
            &self.config,
            self.backends(),
            Arc::new(AtomicBool::new(false)),
        )
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a POSIX shell trainer that understands `--output_dir` and
/// `--output_name` and behaves as `behavior` says.
fn write_trainer(dir: &Path, behavior: &TrainerBehavior) -> PathBuf {
    let action = match behavior {
        TrainerBehavior::Artifact(bytes) => format!(
            "head -c {} /dev/zero > \"$out/$name.safetensors\"\nexit 0",
            bytes
        ),
        TrainerBehavior::PrintAndExit(line) => format!("echo \"{}\"\nexit 0", line),
        TrainerBehavior::ExitCode(code) => format!("echo \"crashed\" >&2\nexit {}", code),
    };
    let body = format!(
        r#"out=""; name=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output_dir) out="$2"; shift 2 ;;
    --output_name) name="$2"; shift 2 ;;
    *) shift ;;
  esac
done
touch "{marker}"
echo "steps: 1/1"
{action}
"#,
        marker = dir.join("trainer_ran").display(),
        action = action
    );
    let script = dir.join("trainer.sh");
    std::fs::write(&script, body).expect("Failed to write trainer script");
    script
}
