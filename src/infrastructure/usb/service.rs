//! Provisioning Controller
//!
//! Coordinates discovery, connection and the single request/response
//! exchange with the firmware, and publishes the lifecycle to the caller.

use crate::domain::error::{ProvisionError, UsbError};
use crate::domain::models::{
    AppEvent, ConfigurationRecord, MessageSeverity, ProvisioningOutcome, ProvisioningStatus,
    StatusMessage,
};
use crate::infrastructure::usb::protocol::{self, default_filters};
use crate::infrastructure::usb::{DeviceFilter, DeviceHandle, DeviceRegistry, TransportDescriptor};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Configuration for controller behavior
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Bound on waiting for the firmware's answer
    pub receive_timeout: Duration,
    /// Hardware identities offered when pairing
    pub filters: Vec<DeviceFilter>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(3000),
            filters: default_filters(),
        }
    }
}

/// Single owner of at most one device handle.
pub struct ProvisioningController<R: DeviceRegistry> {
    registry: R,
    handle: Option<DeviceHandle<R::Device>>,
    config: ControllerConfig,
    status: watch::Sender<ProvisioningStatus>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<R: DeviceRegistry> ProvisioningController<R> {
    pub fn new(
        registry: R,
        config: ControllerConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (status, _) = watch::channel(ProvisioningStatus::Disconnected);
        Self {
            registry,
            handle: None,
            config,
            status,
            event_sender,
        }
    }

    pub fn status(&self) -> ProvisioningStatus {
        *self.status.borrow()
    }

    /// Observe status changes.
    pub fn subscribe(&self) -> watch::Receiver<ProvisioningStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_connected())
    }

    #[cfg(test)]
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Label of the connected device, if any.
    pub fn device_label(&self) -> Option<String> {
        self.handle.as_ref().map(|h| h.descriptor().label())
    }

    /// Silent re-acquisition: connect without prompting when exactly one
    /// previously authorized device is attached.
    pub async fn mount(&mut self) -> Result<bool, ProvisionError> {
        if self.handle.is_some() {
            return Ok(self.is_connected());
        }

        let mut authorized = self.registry.list_authorized().await;
        match authorized.len() {
            0 => {
                info!("No previously authorized device attached");
                Ok(false)
            }
            1 => {
                let descriptor = authorized.remove(0);
                info!("Reconnecting to authorized device {}", descriptor.label());
                self.connect_descriptor(descriptor).await?;
                Ok(true)
            }
            n => {
                info!("{} authorized devices attached, waiting for an explicit choice", n);
                self.send_log(
                    "Several paired devices attached, pick one to connect",
                    MessageSeverity::Info,
                );
                Ok(false)
            }
        }
    }

    /// User-initiated pairing and connection.
    ///
    /// Returns `Ok(false)` when no device was chosen.
    pub async fn connect_manually(&mut self) -> Result<bool, ProvisionError> {
        let current = self.status();
        if !matches!(
            current,
            ProvisioningStatus::Disconnected | ProvisioningStatus::Error
        ) {
            return Err(ProvisionError::InvalidState {
                operation: "connect",
                state: current.as_str(),
            });
        }

        let filters = self.config.filters.clone();
        let descriptor = match self.registry.request_new(&filters).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                self.set_status(ProvisioningStatus::Disconnected);
                self.send_log("No device selected", MessageSeverity::Warning);
                return Ok(false);
            }
            Err(e) => {
                error!("Device selection failed: {}", e);
                self.set_status(ProvisioningStatus::Error);
                self.send_log(&format!("Device selection failed: {}", e), MessageSeverity::Error);
                return Err(e);
            }
        };

        self.connect_descriptor(descriptor).await?;
        Ok(true)
    }

    async fn connect_descriptor(
        &mut self,
        descriptor: TransportDescriptor<R::Device>,
    ) -> Result<(), ProvisionError> {
        self.set_status(ProvisioningStatus::Connecting);
        self.send_log("Connecting to device...", MessageSeverity::Info);
        debug!(
            vendor_id = %format!("{:04x}", descriptor.vendor_id()),
            product_id = %format!("{:04x}", descriptor.product_id()),
            "Opening device"
        );

        let mut handle = DeviceHandle::new(descriptor);
        let connected = handle.connect().await;
        match connected {
            Ok(_) => {
                self.send_log(
                    &format!("Connected to {}", handle.descriptor().label()),
                    MessageSeverity::Success,
                );
                self.handle = Some(handle);
                self.set_status(ProvisioningStatus::Connected);
                Ok(())
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                // The errored handle is discarded; a retry starts from a fresh descriptor
                handle.disconnect().await;
                self.set_status(ProvisioningStatus::Error);
                self.send_log(&format!("Connection failed: {}", e), MessageSeverity::Error);
                Err(e)
            }
        }
    }

    /// Deliver one configuration record and interpret the answer.
    ///
    /// Rejected without any transfer unless a device is connected and idle.
    /// Transport failures, timeouts and unrecognized answers tear the
    /// connection down.
    pub async fn submit(
        &mut self,
        record: &ConfigurationRecord,
    ) -> Result<ProvisioningOutcome, ProvisionError> {
        let current = self.status();
        if !current.accepts_submit() || !self.is_connected() {
            return Err(ProvisionError::InvalidState {
                operation: "submit",
                state: current.as_str(),
            });
        }

        let frame = protocol::encode(record)?;
        let receive_timeout = self.config.receive_timeout;

        self.set_status(ProvisioningStatus::Sending);
        let sent = self.handle_mut("submit")?.send(&frame).await;
        if let Err(e) = sent {
            warn!("Send failed: {}", e);
            self.force_disconnect(&format!("Send failed: {}", e)).await;
            return Ok(ProvisioningOutcome::TransportError);
        }

        self.set_status(ProvisioningStatus::AwaitingResult);
        let receive = self.handle_mut("submit")?.receive();
        let received = tokio::time::timeout(receive_timeout, receive).await;
        let response = match received {
            Ok(Ok(text)) => text,
            // The backend's own transfer timeout fired before ours
            Ok(Err(ProvisionError::Transport(UsbError::Timeout))) => {
                warn!("Device did not answer within the transfer timeout");
                self.force_disconnect("Device did not answer in time").await;
                return Ok(ProvisioningOutcome::Timeout);
            }
            Ok(Err(e)) => {
                warn!("Receive failed: {}", e);
                self.force_disconnect(&format!("Receive failed: {}", e)).await;
                return Ok(ProvisioningOutcome::TransportError);
            }
            Err(_) => {
                let e = ProvisionError::Timeout {
                    timeout_ms: receive_timeout.as_millis() as u64,
                };
                warn!("{}", e);
                self.force_disconnect("Device did not answer in time").await;
                return Ok(ProvisioningOutcome::Timeout);
            }
        };

        info!("Received: {:?}", response);
        let outcome = protocol::decode(&response);
        match outcome {
            ProvisioningOutcome::Success => {
                self.set_status(ProvisioningStatus::Success);
                self.send_log("Successfully configured the device.", MessageSeverity::Success);
            }
            ProvisioningOutcome::Failure => {
                self.set_status(ProvisioningStatus::Failure);
                self.send_log("Failed to configure the device.", MessageSeverity::Error);
            }
            ProvisioningOutcome::Timeout | ProvisioningOutcome::TransportError => {
                self.force_disconnect(&format!("Unexpected answer from device: {:?}", response))
                    .await;
            }
        }

        Ok(outcome)
    }

    /// User-initiated teardown. Always ends in `Disconnected`.
    pub async fn disconnect_manually(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.disconnect().await;
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }
        self.set_status(ProvisioningStatus::Disconnected);
    }

    fn handle_mut(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut DeviceHandle<R::Device>, ProvisionError> {
        let state = self.status().as_str();
        self.handle
            .as_mut()
            .ok_or(ProvisionError::InvalidState { operation, state })
    }

    async fn force_disconnect(&mut self, reason: &str) {
        error!("Dropping connection: {}", reason);
        self.send_log(reason, MessageSeverity::Error);
        if let Some(mut handle) = self.handle.take() {
            debug!(state = handle.state().name(), "Tearing down handle");
            handle.disconnect().await;
        }
        self.set_status(ProvisioningStatus::Disconnected);
    }

    fn set_status(&self, status: ProvisioningStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            let _ = self.event_sender.send(AppEvent::Status(status));
        }
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
