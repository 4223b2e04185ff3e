use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;

use super::BridgeState;
use crate::sandbox::abi;

impl BridgeState {
    pub(super) fn working_directory_opt(&self) -> Option<String> {
        self.new_working_directory
            .clone()
            .or_else(|| self.invocation.working_directory.clone())
    }

    /// Current working directory, empty when the job has none.
    pub fn working_directory(&self) -> String {
        self.working_directory_opt().unwrap_or_default()
    }

    /// Change the job's working directory. Only the first step of a job may
    /// do this; later steps inherit the result.
    pub fn set_working_directory(&mut self, path: &str) -> u32 {
        if self.cancelled() {
            return abi::CANCELLED;
        }
        if !self.invocation.first_step {
            tracing::warn!(
                "[HostBridge] Job {} tried to change its working directory after the first step",
                self.invocation.job_id
            );
            return abi::NOT_PERMITTED;
        }

        let full: PathBuf = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            let base = match self.working_directory_opt() {
                Some(dir) => PathBuf::from(dir),
                None => match std::env::current_dir() {
                    Ok(cwd) => cwd,
                    Err(e) => {
                        tracing::warn!("[HostBridge] Current directory unavailable: {}", e);
                        return abi::CWD_UNAVAILABLE;
                    }
                },
            };
            base.join(path)
        };

        if !full.exists() {
            if let Err(e) = std::fs::create_dir_all(&full) {
                tracing::warn!("[HostBridge] Failed to create {}: {}", full.display(), e);
                return abi::DIR_CREATE_FAILED;
            }
            tracing::info!("[HostBridge] Created directory {}", full.display());
        }

        let full = full.to_string_lossy().into_owned();
        self.record_operation(abi::SUCCESS, &Value::String(full.clone()));
        tracing::info!(
            "[HostBridge] Job {} working directory -> {}",
            self.invocation.job_id,
            full
        );
        self.new_working_directory = Some(full);
        abi::SUCCESS
    }

    /// `create_git_worktree`: check out HEAD of the repository at `base`
    /// (default: the current working directory) into a sibling directory
    /// named `name`, and make it the job's working directory. An existing
    /// sibling is reused as is.
    pub fn create_git_worktree(&mut self, name: &str, base: &str) -> u32 {
        if self.cancelled() {
            return abi::CANCELLED;
        }
        if !self.invocation.first_step {
            tracing::warn!(
                "[HostBridge] Job {} tried to create a worktree after the first step",
                self.invocation.job_id
            );
            return abi::NOT_PERMITTED;
        }

        let base = if base.is_empty() {
            match self.working_directory_opt() {
                Some(dir) => PathBuf::from(dir),
                None => match std::env::current_dir() {
                    Ok(cwd) => cwd,
                    Err(e) => {
                        tracing::warn!("[HostBridge] Current directory unavailable: {}", e);
                        return abi::WORKTREE_BASE_UNAVAILABLE;
                    }
                },
            }
        } else {
            PathBuf::from(base)
        };

        if !base.join(".git").exists() {
            tracing::warn!("[HostBridge] Not a git repository: {}", base.display());
            return abi::NOT_A_GIT_REPO;
        }

        let worktree = base.parent().unwrap_or(&base).join(name);
        if worktree.exists() {
            tracing::info!("[HostBridge] Reusing worktree '{}' at {}", name, worktree.display());
        } else {
            let output = Command::new("git")
                .arg("worktree")
                .arg("add")
                .arg(&worktree)
                .arg("HEAD")
                .current_dir(&base)
                .output();
            match output {
                Ok(o) if o.status.success() => {
                    tracing::info!("[HostBridge] Created worktree '{}' at {}", name, worktree.display());
                }
                Ok(o) => {
                    tracing::warn!(
                        "[HostBridge] git worktree add failed: {}",
                        String::from_utf8_lossy(&o.stderr).trim()
                    );
                    return abi::WORKTREE_ADD_FAILED;
                }
                Err(e) => {
                    tracing::warn!("[HostBridge] Failed to run git: {}", e);
                    return abi::WORKTREE_ADD_FAILED;
                }
            }
        }

        let path = worktree.to_string_lossy().into_owned();
        self.record_operation(abi::SUCCESS, &Value::String(path.clone()));
        self.new_working_directory = Some(path);
        abi::SUCCESS
    }
}
