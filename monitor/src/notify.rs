//! Emergency Notification Dispatch
//!
//! [`NotificationDispatcher`] is the seam between the alert state machine
//! and whatever actually reaches the emergency contacts. [`NotifyAction`]
//! is the local implementation: log lines and shell commands.

use fallwatch_link::EmergencyNotification;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("Notification rejected: {0}")]
    Rejected(String),

    #[error("No acknowledgement for alert {0}")]
    Unacknowledged(String),

    #[error("Notification command failed: {0}")]
    Command(String),

    #[error("Dispatch of alert {alert_id} failed after {attempts} attempts: {reason}")]
    Exhausted {
        alert_id: String,
        attempts: u32,
        reason: String,
    },
}

/// Delivers one emergency notification
pub trait NotificationDispatcher: Send + Sync {
    fn name(&self) -> &str;

    fn dispatch<'a>(
        &'a self,
        alert_id: &'a str,
        notification: &'a EmergencyNotification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}

/// Local notification action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyAction {
    /// Log message
    Log { level: String, message: String },
    /// Run a command and wait for it
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Run actions in order, stopping at the first failure
    Multiple { actions: Vec<NotifyAction> },
}

impl NotifyAction {
    /// Run the action for `alert_id`
    pub fn run<'a>(
        &'a self,
        alert_id: &'a str,
        notification: &'a EmergencyNotification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                NotifyAction::Log { level, message } => {
                    let formatted = render(message, alert_id, notification);

                    match level.as_str() {
                        "error" => tracing::error!("{}", formatted),
                        "warn" => tracing::warn!("{}", formatted),
                        "debug" => tracing::debug!("{}", formatted),
                        _ => tracing::info!("{}", formatted),
                    }
                }

                NotifyAction::Command { command, args } => {
                    let args: Vec<String> = args.iter().map(|a| render(a, alert_id, notification)).collect();
                    tracing::info!("Executing: {} {:?}", command, args);

                    let status = tokio::process::Command::new(command)
                        .args(&args)
                        .status()
                        .await
                        .map_err(|e| DispatchError::Command(format!("{}: {}", command, e)))?;

                    if !status.success() {
                        return Err(DispatchError::Command(format!("{} exited with {}", command, status)));
                    }
                }

                NotifyAction::Multiple { actions } => {
                    for action in actions {
                        action.run(alert_id, notification).await?;
                    }
                }
            }

            Ok(())
        })
    }
}

impl NotificationDispatcher for NotifyAction {
    fn name(&self) -> &str {
        match self {
            NotifyAction::Log { .. } => "log",
            NotifyAction::Command { .. } => "command",
            NotifyAction::Multiple { .. } => "multiple",
        }
    }

    fn dispatch<'a>(
        &'a self,
        alert_id: &'a str,
        notification: &'a EmergencyNotification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        self.run(alert_id, notification)
    }
}

/// Substitute `{id}`, `{severity}`, `{recipients}` and `{timestamp}`
pub fn render(template: &str, alert_id: &str, notification: &EmergencyNotification) -> String {
    template
        .replace("{id}", alert_id)
        .replace("{severity}", &notification.severity)
        .replace("{recipients}", &notification.recipients.join(", "))
        .replace("{timestamp}", &notification.timestamp.to_rfc3339())
}
