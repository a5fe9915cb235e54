//! Dependent-service restart handling.
//!
//! When the crash classifier recognises a dependent-service crash, the
//! runner asks the injected [`ServiceSupervisor`] to restart the backend
//! before its single retry. The default implementation shells out to
//! `systemctl restart <service_name>` with a bounded timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

/// Default timeout for a restart operation.
const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(60);

/// Allowed service name characters: alphanumeric, hyphen, underscore,
/// dot. Prevents shell injection via the service name field.
fn is_safe_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Outcome of a restart attempt, recorded in the retry audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct RestartOutcome {
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
}

/// Restarts the dependent external process the executor talks to.
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn restart(&self) -> RestartOutcome;
}

/// Supervisor that restarts a systemd unit.
pub struct SystemctlSupervisor {
    service_name: String,
    timeout: Duration,
}

impl SystemctlSupervisor {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            timeout: DEFAULT_RESTART_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ServiceSupervisor for SystemctlSupervisor {
    async fn restart(&self) -> RestartOutcome {
        let start = std::time::Instant::now();

        if !is_safe_service_name(&self.service_name) {
            return RestartOutcome {
                success: false,
                message: "Invalid service name".to_string(),
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }

        tracing::info!(service = %self.service_name, "Restarting dependent service");

        let result = tokio::time::timeout(
            self.timeout,
            Command::new("systemctl")
                .args(["restart", &self.service_name])
                .output(),
        )
        .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                let success = output.status.success();
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = if success {
                    format!("Service '{}' restarted successfully", self.service_name)
                } else {
                    format!(
                        "Service '{}' restart failed (exit {}): {}",
                        self.service_name,
                        output.status.code().unwrap_or(-1),
                        stderr.trim(),
                    )
                };

                if success {
                    tracing::info!(service = %self.service_name, elapsed_ms, "Restart succeeded");
                } else {
                    tracing::error!(
                        service = %self.service_name,
                        elapsed_ms,
                        stderr = %stderr.trim(),
                        "Restart failed",
                    );
                }

                RestartOutcome {
                    success,
                    message,
                    duration_ms: elapsed_ms,
                }
            }
            Ok(Err(e)) => {
                tracing::error!(service = %self.service_name, error = %e, "Restart execution error");
                RestartOutcome {
                    success: false,
                    message: format!("Failed to execute systemctl: {e}"),
                    duration_ms: elapsed_ms,
                }
            }
            Err(_) => {
                tracing::error!(service = %self.service_name, "Restart timed out");
                RestartOutcome {
                    success: false,
                    message: format!(
                        "Restart of '{}' timed out after {}s",
                        self.service_name,
                        self.timeout.as_secs(),
                    ),
                    duration_ms: elapsed_ms,
                }
            }
        }
    }
}

/// Supervisor that does nothing. Used when the backend is managed
/// externally, and by tests asserting no restart was attempted.
pub struct NoopSupervisor;

#[async_trait]
impl ServiceSupervisor for NoopSupervisor {
    async fn restart(&self) -> RestartOutcome {
        RestartOutcome {
            success: true,
            message: "No supervisor configured".to_string(),
            duration_ms: 0,
        }
    }
}
