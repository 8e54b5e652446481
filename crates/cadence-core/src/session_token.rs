use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::STATE_DIR_NAME;

const TOKEN_FILE_NAME: &str = "session.token";

/// Session token gating WebSocket access.
///
/// Generated on startup and persisted to `.cadence/session.token` so the
/// command driver on the same machine can read it. 256 bits of entropy,
/// hex-encoded, so the value is URL-safe.
pub struct SessionTokenManager {
    token_file: PathBuf,
    token: String,
}

impl SessionTokenManager {
    pub fn new(project_root: &Path) -> Self {
        let token_file = project_root.join(STATE_DIR_NAME).join(TOKEN_FILE_NAME);

        if let Ok(existing) = std::fs::read_to_string(&token_file) {
            let existing = existing.trim();
            if !existing.is_empty() {
                tracing::info!(token_file = %token_file.display(), "session token loaded");
                return Self {
                    token_file,
                    token: existing.to_string(),
                };
            }
        }

        let token = new_token();
        tracing::info!(token_length = token.len(), "session token generated");
        let manager = Self { token_file, token };
        // Only persist when the state dir already exists; creating it during
        // construction interferes with project state detection.
        if manager
            .token_file
            .parent()
            .map(Path::exists)
            .unwrap_or(false)
        {
            manager.ensure_persisted();
        }
        manager
    }

    pub fn ensure_persisted(&self) {
        if self.token_file.exists() {
            return;
        }
        let write = self
            .token_file
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| std::fs::write(&self.token_file, &self.token));
        match write {
            Ok(()) => {
                tracing::info!(token_file = %self.token_file.display(), "session token persisted")
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to persist session token")
            }
        }
    }

    /// Constant-time validation: both sides are hashed before comparison so
    /// equality checking never short-circuits on the raw token bytes.
    pub fn validate(&self, candidate: Option<&str>) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        Sha256::digest(candidate.as_bytes()) == Sha256::digest(self.token.as_bytes())
    }

    /// Invalidates all existing connections.
    pub fn regenerate(&mut self) -> &str {
        self.token = new_token();
        if let Err(error) = std::fs::write(&self.token_file, &self.token) {
            tracing::error!(error = %error, "failed to store regenerated token");
        }
        &self.token
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn token_file_path(&self) -> &Path {
        &self.token_file
    }
}

fn new_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}
