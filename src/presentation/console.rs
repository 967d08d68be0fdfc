//! Terminal rendering of controller events.

use crate::domain::models::{AppEvent, MessageSeverity, ProvisioningOutcome, StatusMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn marker(severity: MessageSeverity) -> &'static str {
    match severity {
        MessageSeverity::Info => "[..]",
        MessageSeverity::Success => "[ok]",
        MessageSeverity::Warning => "[!!]",
        MessageSeverity::Error => "[xx]",
    }
}

pub fn format_message(message: &StatusMessage) -> String {
    format!("{} {}", marker(message.severity), message.message)
}

pub fn format_outcome(outcome: ProvisioningOutcome) -> String {
    let severity = match outcome {
        ProvisioningOutcome::Success => MessageSeverity::Success,
        ProvisioningOutcome::Failure => MessageSeverity::Error,
        ProvisioningOutcome::Timeout | ProvisioningOutcome::TransportError => {
            MessageSeverity::Warning
        }
    };
    format!("{} Provisioning result: {}", marker(severity), outcome)
}

/// Print status messages to stderr until every sender is dropped.
pub fn spawn_event_printer(mut events: mpsc::UnboundedReceiver<AppEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                AppEvent::LogMessage(message) => eprintln!("{}", format_message(&message)),
                AppEvent::Status(status) => tracing::debug!(%status, "Status changed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_message() {
        let message = StatusMessage {
            message: "Connected".to_string(),
            severity: MessageSeverity::Success,
        };
        assert_eq!(format_message(&message), "[ok] Connected");
    }

    #[test]
    fn test_format_outcome() {
        assert_eq!(
            format_outcome(ProvisioningOutcome::Timeout),
            "[!!] Provisioning result: timeout"
        );
    }
}
