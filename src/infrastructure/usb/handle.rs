//! Device Handle
//!
//! Owns the open connection to one device: negotiates the firmware's data
//! channel, performs raw bulk transfers and tears the channel down.

use crate::domain::error::{ProvisionError, UsbError};
use crate::infrastructure::usb::protocol::{
    CHANNEL_DISABLE, CHANNEL_ENABLE, CHANNEL_INTERFACE, DEFAULT_CONFIGURATION, MAX_PACKET_SIZE,
    SET_CHANNEL_REQUEST, VENDOR_SPECIFIC_CLASS,
};
use crate::infrastructure::usb::{
    ClaimState, ClassRequest, ConfigurationInfo, Direction, EndpointInfo, TransferType,
    TransportDescriptor, UsbDevice,
};
use tracing::{debug, info, instrument, warn};

/// The negotiated data channel, only present while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    Opening,
    Negotiating,
    Connected(Channel),
    Closing,
    Error,
}

impl HandleState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Negotiating => "negotiating",
            Self::Connected(_) => "connected",
            Self::Closing => "closing",
            Self::Error => "in error",
        }
    }
}

/// Exclusive connection to one device.
///
/// Every operation takes `&mut self`, so transfers on one handle can never
/// overlap.
pub struct DeviceHandle<D: UsbDevice> {
    descriptor: TransportDescriptor<D>,
    state: HandleState,
    open: bool,
}

impl<D: UsbDevice> DeviceHandle<D> {
    pub fn new(descriptor: TransportDescriptor<D>) -> Self {
        Self {
            descriptor,
            state: HandleState::Idle,
            open: false,
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, HandleState::Connected(_))
    }

    pub fn descriptor(&self) -> &TransportDescriptor<D> {
        &self.descriptor
    }

    /// Open the device and enable the firmware's data channel.
    ///
    /// Only valid from `Idle`. On failure the handle is left in `Error` and
    /// must be torn down with [`disconnect`](Self::disconnect) and dropped.
    #[instrument(skip(self), fields(device = %self.descriptor.label()))]
    pub async fn connect(&mut self) -> Result<Channel, ProvisionError> {
        if self.state != HandleState::Idle {
            return Err(ProvisionError::InvalidState {
                operation: "connect",
                state: self.state.name(),
            });
        }

        self.state = HandleState::Opening;
        let opened = self.descriptor.device_mut().open().await;
        if let Err(e) = opened {
            self.state = HandleState::Error;
            return Err(match e {
                UsbError::Access => {
                    warn!("Access to the device was denied. Check udev rules or the installed USB driver.");
                    ProvisionError::PermissionDenied(self.descriptor.label())
                }
                other => ProvisionError::Transport(other),
            });
        }
        self.open = true;

        self.state = HandleState::Negotiating;
        let negotiated = self.negotiate().await;
        match negotiated {
            Ok(channel) => {
                info!(
                    interface = channel.interface,
                    endpoint_in = %format!("0x{:02x}", channel.endpoint_in),
                    endpoint_out = %format!("0x{:02x}", channel.endpoint_out),
                    "Data channel enabled"
                );
                self.state = HandleState::Connected(channel);
                Ok(channel)
            }
            Err(e) => {
                warn!("Negotiation failed: {}", e);
                self.state = HandleState::Error;
                Err(e)
            }
        }
    }

    async fn negotiate(&mut self) -> Result<Channel, ProvisionError> {
        let device = self.descriptor.device_mut();

        let config = match device.active_configuration().await? {
            Some(config) => config,
            None => {
                debug!("Device unconfigured, selecting configuration {}", DEFAULT_CONFIGURATION);
                device.select_configuration(DEFAULT_CONFIGURATION).await?;
                device.active_configuration().await?.ok_or_else(|| {
                    UsbError::Other("No active configuration after selection".to_string())
                })?
            }
        };

        let (endpoint_in, endpoint_out) = find_channel_endpoints(&config)?;

        device.claim_interface(CHANNEL_INTERFACE).await?;
        self.descriptor.set_claim_state(ClaimState::Claimed);

        let device = self.descriptor.device_mut();
        device
            .select_alternate_interface(CHANNEL_INTERFACE, 0)
            .await?;
        device
            .control_transfer_out(channel_request(CHANNEL_ENABLE))
            .await?;

        Ok(Channel {
            interface: CHANNEL_INTERFACE,
            endpoint_in,
            endpoint_out,
        })
    }

    fn channel(&self, operation: &'static str) -> Result<Channel, ProvisionError> {
        match self.state {
            HandleState::Connected(channel) => Ok(channel),
            other => Err(ProvisionError::InvalidState {
                operation,
                state: other.name(),
            }),
        }
    }

    /// Bulk OUT to the negotiated endpoint. Payload semantics are left to the caller.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, ProvisionError> {
        let channel = self.channel("send")?;
        let written = self
            .descriptor
            .device_mut()
            .transfer_out(channel.endpoint_out, data)
            .await;
        match written {
            Ok(written) => {
                debug!(bytes_written = written, "Send complete");
                Ok(written)
            }
            Err(e) => {
                self.state = HandleState::Error;
                Err(e.into())
            }
        }
    }

    /// Bulk IN of one packet, decoded as UTF-8 and returned verbatim.
    #[instrument(skip(self))]
    pub async fn receive(&mut self) -> Result<String, ProvisionError> {
        let channel = self.channel("receive")?;
        let received = self
            .descriptor
            .device_mut()
            .transfer_in(channel.endpoint_in, MAX_PACKET_SIZE)
            .await;
        let bytes = match received {
            Ok(bytes) => bytes,
            Err(e) => {
                self.state = HandleState::Error;
                return Err(e.into());
            }
        };

        debug!(bytes_read = bytes.len(), "Receive complete");
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Best-effort teardown back to `Idle`.
    ///
    /// The disable request, interface release and close are each attempted
    /// once; failures are logged and never returned. Calling this on an
    /// `Idle` handle does nothing.
    #[instrument(skip(self), fields(device = %self.descriptor.label()))]
    pub async fn disconnect(&mut self) {
        if self.state == HandleState::Idle {
            return;
        }
        self.state = HandleState::Closing;

        if self.descriptor.claim_state() == ClaimState::Claimed {
            let device = self.descriptor.device_mut();
            if let Err(e) = device
                .control_transfer_out(channel_request(CHANNEL_DISABLE))
                .await
            {
                warn!("Failed to disable data channel: {}", e);
            }
            if let Err(e) = device.release_interface(CHANNEL_INTERFACE).await {
                warn!("Failed to release interface {}: {}", CHANNEL_INTERFACE, e);
            }
            self.descriptor.set_claim_state(ClaimState::Unclaimed);
        }

        if self.open {
            if let Err(e) = self.descriptor.device_mut().close().await {
                warn!("Failed to close device: {}", e);
            }
            self.open = false;
        }

        self.state = HandleState::Idle;
        info!("Device disconnected");
    }
}

fn channel_request(value: u16) -> ClassRequest {
    ClassRequest {
        request: SET_CHANNEL_REQUEST,
        value,
        index: CHANNEL_INTERFACE as u16,
    }
}

/// Locate the bulk IN/OUT pair on alternate setting 0 of the channel interface.
fn find_channel_endpoints(config: &ConfigurationInfo) -> Result<(u8, u8), ProvisionError> {
    let interface = config
        .interfaces
        .iter()
        .find(|i| {
            i.number == CHANNEL_INTERFACE
                && i.alternates
                    .iter()
                    .any(|a| a.class_code == VENDOR_SPECIFIC_CLASS)
        })
        .ok_or(ProvisionError::InterfaceNotFound {
            interface: CHANNEL_INTERFACE,
        })?;

    let endpoints: &[EndpointInfo] = interface
        .alternates
        .iter()
        .find(|a| a.setting == 0)
        .map(|a| a.endpoints.as_slice())
        .unwrap_or_default();

    let find = |direction: Direction| {
        endpoints
            .iter()
            .find(|e| e.direction == direction && e.transfer_type == TransferType::Bulk)
            .map(|e| e.address)
    };

    let endpoint_in = find(Direction::In).ok_or(ProvisionError::EndpointNotFound { direction: "in" })?;
    let endpoint_out = find(Direction::Out).ok_or(ProvisionError::EndpointNotFound { direction: "out" })?;

    Ok((endpoint_in, endpoint_out))
}
