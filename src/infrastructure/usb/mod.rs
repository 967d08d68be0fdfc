//! USB Provisioning Module
//!
//! Delivers a configuration record to a sensor over its vendor-specific USB
//! interface and interprets the firmware's acknowledgement.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 ProvisioningController                   │
//! │   (lifecycle state machine - public API for the CLI)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌────────────┐ ┌─────────────┐ ┌──────────┐
//! │  Registry  │ │DeviceHandle │ │ Protocol │
//! │            │ │             │ │          │
//! │ - allow-   │ │ - negotiate │ │ - frame  │
//! │   list     │ │ - bulk I/O  │ │   encode │
//! │ - chooser  │ │ - teardown  │ │ - result │
//! └────────────┘ └─────────────┘ └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Wire constants, vendor allow-list and the configuration codec
//! - [`registry`] - Authorized device listing and user-driven pairing
//! - [`chooser`] - Interactive and automatic device pickers
//! - [`handle`] - Connection state machine over control/bulk transfers
//! - [`rusb_backend`] - libusb implementation of [`UsbBus`] and [`UsbDevice`]
//! - [`service`] - Provisioning controller

pub mod chooser;
pub mod handle;
pub mod protocol;
pub mod registry;
pub mod rusb_backend;
pub mod service;

#[cfg(test)]
pub mod mock;

use crate::domain::error::{ProvisionError, UsbError};

pub use handle::DeviceHandle;
pub use registry::UsbRegistry;
pub use service::ProvisioningController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Full endpoint address including the direction bit
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateInfo {
    pub setting: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alternates: Vec<AlternateInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationInfo {
    pub value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

/// A class-scoped, interface-recipient OUT control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Platform access to one physical device.
///
/// All operations must be awaited to completion before the next one is
/// issued on the same device.
#[allow(async_fn_in_trait)]
pub trait UsbDevice: Send + Sync {
    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    /// Human readable label for choosers and logs.
    fn label(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id(), self.product_id())
    }

    async fn open(&mut self) -> Result<(), UsbError>;

    /// The active configuration, or `None` while the device is unconfigured.
    async fn active_configuration(&self) -> Result<Option<ConfigurationInfo>, UsbError>;

    async fn select_configuration(&mut self, value: u8) -> Result<(), UsbError>;

    async fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    async fn release_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    async fn select_alternate_interface(
        &mut self,
        interface: u8,
        setting: u8,
    ) -> Result<(), UsbError>;

    async fn control_transfer_out(&mut self, request: ClassRequest) -> Result<(), UsbError>;

    /// Bulk OUT; returns the number of bytes written.
    async fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, UsbError>;

    /// Bulk IN of at most `max_len` bytes.
    async fn transfer_in(&mut self, endpoint: u8, max_len: usize) -> Result<Vec<u8>, UsbError>;

    async fn close(&mut self) -> Result<(), UsbError>;
}

/// Enumeration of the devices currently attached to the host.
#[allow(async_fn_in_trait)]
pub trait UsbBus: Send + Sync {
    type Device: UsbDevice;

    async fn devices(&self) -> Result<Vec<Self::Device>, UsbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Unclaimed,
    Claimed,
}

/// One physically present candidate device, prior to any open connection.
#[derive(Debug)]
pub struct TransportDescriptor<D> {
    device: D,
    claim: ClaimState,
}

impl<D: UsbDevice> TransportDescriptor<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            claim: ClaimState::Unclaimed,
        }
    }

    pub fn vendor_id(&self) -> u16 {
        self.device.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.device.product_id()
    }

    pub fn claim_state(&self) -> ClaimState {
        self.claim
    }

    pub fn label(&self) -> String {
        self.device.label()
    }

    pub(crate) fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub(crate) fn set_claim_state(&mut self, claim: ClaimState) {
        self.claim = claim;
    }
}

/// Hardware identity filter for device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub const fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: None,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id.map_or(true, |p| p == product_id)
    }
}

/// Source of device descriptors for the controller.
#[allow(async_fn_in_trait)]
pub trait DeviceRegistry: Send + Sync {
    type Device: UsbDevice;

    /// Devices the user granted access to earlier. Never prompts.
    async fn list_authorized(&self) -> Vec<TransportDescriptor<Self::Device>>;

    /// Let the user pick a new device. `Ok(None)` when cancelled or nothing matched.
    async fn request_new(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Option<TransportDescriptor<Self::Device>>, ProvisionError>;
}
