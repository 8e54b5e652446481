use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::STATE_DIR_NAME;

const LOCK_FILE_NAME: &str = "session.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockInterface {
    Cli,
    Web,
}

impl LockInterface {
    pub fn as_str(self) -> &'static str {
        match self {
            LockInterface::Cli => "cli",
            LockInterface::Web => "web",
        }
    }
}

impl std::fmt::Display for LockInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFileData {
    interface: LockInterface,
    mode: LockMode,
    pid: u32,
    timestamp: String,
}

/// Mode available to the caller plus who currently holds the file, if
/// anyone. A stale or absent lock reports `mode = write, holder = None`.
#[derive(Debug, Clone, Serialize)]
pub struct LockState {
    pub mode: LockMode,
    pub holder: Option<LockInterface>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("session locked by {holder} (pid {pid})")]
    LockHeld { holder: LockInterface, pid: u32 },

    #[error("cannot force unlock: process {pid} is still running; terminate it first")]
    HolderAlive { pid: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cross-process read/write file lock arbitrating mutating access between
/// the command driver and the observability server.
///
/// Read mode always succeeds (observers coexist); write mode is exclusive
/// and backed by `.cadence/session.lock`. Only the process whose PID is
/// recorded in the file may release it; a holder whose PID is no longer
/// alive is treated as stale and reclaimed.
pub struct SessionLock {
    lock_file: PathBuf,
    state: Mutex<Option<LockMode>>,
}

impl SessionLock {
    pub fn new(project_root: &Path) -> Self {
        let lock_file = project_root.join(STATE_DIR_NAME).join(LOCK_FILE_NAME);
        tracing::info!(lock_file = %lock_file.display(), "session lock initialized");
        Self {
            lock_file,
            state: Mutex::new(None),
        }
    }

    pub fn lock_file_path(&self) -> &Path {
        &self.lock_file
    }

    pub fn current_mode(&self) -> Option<LockMode> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn acquire(&self, interface: LockInterface, mode: LockMode) -> Result<(), LockError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if mode == LockMode::Read {
            *state = Some(LockMode::Read);
            tracing::info!(interface = interface.as_str(), "read lock acquired");
            return Ok(());
        }

        if self.lock_file.exists() {
            match read_lock_file(&self.lock_file) {
                Some(data) if data.pid == std::process::id() => {
                    tracing::info!(interface = interface.as_str(), "write lock already held");
                    *state = Some(LockMode::Write);
                    return Ok(());
                }
                Some(data) if process_alive(data.pid) => {
                    tracing::warn!(
                        holder = data.interface.as_str(),
                        holder_pid = data.pid,
                        requester = interface.as_str(),
                        "write lock denied"
                    );
                    return Err(LockError::LockHeld {
                        holder: data.interface,
                        pid: data.pid,
                    });
                }
                Some(data) => {
                    tracing::info!(pid = data.pid, "removing stale lock");
                    std::fs::remove_file(&self.lock_file)?;
                }
                None => {
                    tracing::warn!("removing corrupt lock file");
                    std::fs::remove_file(&self.lock_file)?;
                }
            }
        }

        let data = LockFileData {
            interface,
            mode: LockMode::Write,
            pid: std::process::id(),
            timestamp: Utc::now().to_rfc3339(),
        };
        write_lock_file(&self.lock_file, &data)?;
        *state = Some(LockMode::Write);
        tracing::info!(
            interface = interface.as_str(),
            pid = data.pid,
            "write lock acquired"
        );
        Ok(())
    }

    /// Safe to call when no lock is held. Refuses to remove another
    /// process's lock file.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.lock_file.exists() {
            match read_lock_file(&self.lock_file) {
                Some(data) if data.pid == std::process::id() => {
                    if let Err(error) = std::fs::remove_file(&self.lock_file) {
                        tracing::error!(error = %error, "lock release failed");
                    } else {
                        tracing::info!("lock released");
                    }
                }
                Some(data) => {
                    tracing::warn!(
                        our_pid = std::process::id(),
                        lock_pid = data.pid,
                        "lock release denied: not the holder"
                    );
                }
                None => {
                    tracing::warn!("lock release skipped: unreadable lock file");
                }
            }
        }
        *state = None;
    }

    pub fn upgrade(&self, interface: LockInterface) -> Result<(), LockError> {
        tracing::info!(interface = interface.as_str(), "lock upgrade requested");
        self.acquire(interface, LockMode::Write)
    }

    /// Drop the write lock and fall back to read mode.
    pub fn downgrade(&self, interface: LockInterface) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != Some(LockMode::Write) {
            tracing::warn!(current = ?*state, "downgrade denied");
            return false;
        }
        if self.lock_file.exists() {
            match read_lock_file(&self.lock_file) {
                Some(data) if data.pid == std::process::id() => {
                    if let Err(error) = std::fs::remove_file(&self.lock_file) {
                        tracing::error!(error = %error, "downgrade failed");
                        return false;
                    }
                }
                _ => {}
            }
        }
        *state = Some(LockMode::Read);
        tracing::info!(interface = interface.as_str(), "lock downgraded to read");
        true
    }

    pub fn is_write_locked_by_other(&self) -> bool {
        let _state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !self.lock_file.exists() {
            return false;
        }
        match read_lock_file(&self.lock_file) {
            Some(data) if data.pid == std::process::id() => false,
            Some(data) => process_alive(data.pid),
            None => false,
        }
    }

    pub fn get_lock_state(&self) -> LockState {
        let _state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let unlocked = LockState {
            mode: LockMode::Write,
            holder: None,
            timestamp: None,
        };
        if !self.lock_file.exists() {
            return unlocked;
        }
        match read_lock_file(&self.lock_file) {
            Some(data) if data.pid == std::process::id() => LockState {
                mode: LockMode::Write,
                holder: Some(data.interface),
                timestamp: Some(data.timestamp),
            },
            Some(data) if process_alive(data.pid) => LockState {
                mode: LockMode::Read,
                holder: Some(data.interface),
                timestamp: Some(data.timestamp),
            },
            // Stale lock reports the same state as no lock.
            _ => unlocked,
        }
    }

    /// Admin operation: remove the lock file if its holder is dead or the
    /// file is corrupt. A live holder is never removed.
    pub fn force_unlock(&self) -> Result<(), LockError> {
        let _state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !self.lock_file.exists() {
            tracing::info!("force unlock: no lock present");
            return Ok(());
        }
        match read_lock_file(&self.lock_file) {
            Some(data) => {
                if process_alive(data.pid) {
                    return Err(LockError::HolderAlive { pid: data.pid });
                }
                std::fs::remove_file(&self.lock_file)?;
                tracing::warn!(
                    pid = data.pid,
                    interface = data.interface.as_str(),
                    "force unlock removed stale lock"
                );
                Ok(())
            }
            None => {
                std::fs::remove_file(&self.lock_file)?;
                tracing::warn!("force unlock removed corrupt lock file");
                Ok(())
            }
        }
    }
}

fn read_lock_file(path: &Path) -> Option<LockFileData> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn write_lock_file(path: &Path, data: &LockFileData) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Atomic write: temp file then rename. Unix rename replaces an existing
    // file atomically; Windows requires the unlink first.
    let temp = path.with_extension("tmp");
    let payload = serde_json::to_string_pretty(data).unwrap_or_default();
    std::fs::write(&temp, payload)?;
    #[cfg(windows)]
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    match std::fs::rename(&temp, path) {
        Ok(()) => Ok(()),
        Err(error) => {
            let _ = std::fs::remove_file(&temp);
            Err(error)
        }
    }
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Permission denied still means the process exists.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    // No null-signal facility; err on the side of treating the holder as
    // alive so a live lock is never stolen.
    true
}
