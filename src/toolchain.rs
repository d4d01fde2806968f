//! Dev-server toolchain detection

use crate::error::PreviewError;
use std::path::PathBuf;
use tracing::debug;

/// Resolve the runner command to an executable path.
///
/// Absolute and relative paths are checked as-is; bare names are searched
/// for on `PATH`.
pub fn resolve_command(command: &str) -> Result<PathBuf, PreviewError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(PreviewError::ToolchainUnavailable {
            command: String::new(),
            reason: "no dev-server command configured".to_string(),
        });
    }

    match which::which(command) {
        Ok(path) => {
            debug!(command, path = %path.display(), "Resolved dev-server command");
            Ok(path)
        }
        Err(e) => Err(PreviewError::ToolchainUnavailable {
            command: command.to_string(),
            reason: e.to_string(),
        }),
    }
}
