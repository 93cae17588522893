use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::models::ManagerSettings;

use super::environment::{CORE_RDB_FILES, YUMIA_EXE_NAME, backup_name, file_exists_ci};

/// Lines of patcher output kept in logs and errors.
const OUTPUT_TAIL_LINES: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("yumia executable not found at {0}")]
    ExecutableMissing(Utf8PathBuf),

    #[error("failed to start yumia: {0}")]
    Spawn(String),

    #[error("yumia timed out after {0:?}")]
    Timeout(Duration),

    #[error("yumia exited with code {code}: {output}")]
    ExitCode { code: i32, output: String },

    #[error("yumia finished but did not create {}", .0.join(", "))]
    BackupsNotCreated(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub exit_code: i32,
    pub output: String,
    pub duration: Duration,
}

/// The external tool that rewrites `root.rdb`/`root.rdx` from the `.fdata`
/// payloads in the package directory.
#[async_trait]
pub trait Patcher: Send + Sync {
    /// Run against `package_dir`. Only a zero exit is success; the backup
    /// check is done by the caller through [`verify_backups`].
    async fn apply(&self, package_dir: &Utf8Path) -> Result<PatchReport, PatchError>;
}

/// Runs `yumia_mod_insert_into_rdb.exe` from the package directory.
pub struct YumiaPatcher {
    executable: Utf8PathBuf,
    timeout: Duration,
}

impl YumiaPatcher {
    pub fn new(executable: impl Into<Utf8PathBuf>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
        }
    }
}

fn output_tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n")
}

#[async_trait]
impl Patcher for YumiaPatcher {
    async fn apply(&self, package_dir: &Utf8Path) -> Result<PatchReport, PatchError> {
        if !self.executable.is_file() {
            return Err(PatchError::ExecutableMissing(self.executable.clone()));
        }

        tracing::info!("Running yumia: {}", self.executable);
        let start = Instant::now();

        let mut child = Command::new(self.executable.as_std_path())
            .arg(package_dir.as_str())
            .current_dir(package_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PatchError::Spawn(e.to_string()))?;

        // The tool waits for a confirmation keypress before exiting.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(b"y\n").await {
                tracing::debug!("Could not answer yumia prompt: {}", e);
            }
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                tracing::warn!("yumia timed out after {:?}", self.timeout);
                PatchError::Timeout(self.timeout)
            })?
            .map_err(|e| PatchError::Spawn(e.to_string()))?;

        let duration = start.elapsed();
        let exit_code = output.status.code().unwrap_or(-1);
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let tail = output_tail(&text);

        tracing::info!(
            "yumia completed in {:.2}s with exit code {}",
            duration.as_secs_f32(),
            exit_code
        );
        for line in tail.lines() {
            tracing::debug!("[yumia] {}", line);
        }

        if exit_code != 0 {
            return Err(PatchError::ExitCode {
                code: exit_code,
                output: tail,
            });
        }

        Ok(PatchReport {
            exit_code,
            output: text,
            duration,
        })
    }
}

/// Stand-in for the real tool on machines that cannot run it.
///
/// Creates empty core RDB files when missing and copies them to their
/// `.original` backups on first run, which is all the manager observes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedPatcher;

#[async_trait]
impl Patcher for SimulatedPatcher {
    async fn apply(&self, package_dir: &Utf8Path) -> Result<PatchReport, PatchError> {
        let io_err = |e: std::io::Error| PatchError::Spawn(e.to_string());
        tracing::info!("Running simulated yumia in {}", package_dir);

        for core in CORE_RDB_FILES {
            let core_path = package_dir.join(core);
            let backup_path = package_dir.join(backup_name(core));
            if !core_path.exists() {
                tokio::fs::write(&core_path, b"").await.map_err(io_err)?;
            }
            if !backup_path.exists() {
                tokio::fs::copy(&core_path, &backup_path).await.map_err(io_err)?;
                tracing::debug!("Created simulated backup {}", backup_path);
            }
        }

        Ok(PatchReport {
            exit_code: 0,
            output: "simulated yumia".to_string(),
            duration: Duration::ZERO,
        })
    }
}

/// Both `.original` backups must exist after a successful run.
pub fn verify_backups(package_dir: &Utf8Path) -> Result<(), PatchError> {
    let missing: Vec<String> = CORE_RDB_FILES
        .iter()
        .map(|core| backup_name(core))
        .filter(|backup| !file_exists_ci(package_dir, backup))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PatchError::BackupsNotCreated(missing))
    }
}

/// The patcher selected by the settings.
pub fn patcher_for(settings: &ManagerSettings, package_dir: &Utf8Path) -> Arc<dyn Patcher> {
    if settings.mock_patcher {
        tracing::info!("Using simulated yumia patcher");
        Arc::new(SimulatedPatcher)
    } else {
        Arc::new(YumiaPatcher::new(
            package_dir.join(YUMIA_EXE_NAME),
            settings.patcher_timeout(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_simulated_patcher_creates_backups() {
        let temp = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        std::fs::write(dir.join("root.rdb"), b"vanilla").unwrap();

        assert!(verify_backups(&dir).is_err());
        SimulatedPatcher.apply(&dir).await.unwrap();
        verify_backups(&dir).unwrap();
        assert_eq!(std::fs::read(dir.join("root.rdb.original")).unwrap(), b"vanilla");
    }

    #[test]
    fn test_missing_executable() {
        let patcher = YumiaPatcher::new("/nonexistent/yumia.exe", Duration::from_secs(1));
        let err = tokio_test::block_on(patcher.apply(Utf8Path::new("/nonexistent"))).unwrap_err();
        assert!(matches!(err, PatchError::ExecutableMissing(_)));
    }

    #[test]
    fn test_output_tail_keeps_last_lines() {
        let text: String = (0..15).map(|i| format!("line {i}\n")).collect();
        let tail = output_tail(&text);
        assert_eq!(tail.lines().count(), OUTPUT_TAIL_LINES);
        assert!(tail.ends_with("line 14"));
    }
}
