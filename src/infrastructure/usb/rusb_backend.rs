//! libusb backend.
//!
//! rusb calls block, so each one runs on tokio's blocking pool and the
//! handle is shared with that pool through an `Arc<Mutex<_>>`.

use crate::domain::error::UsbError;
use crate::infrastructure::usb::{
    AlternateInfo, ClassRequest, ConfigurationInfo, Direction, EndpointInfo, InterfaceInfo,
    TransferType, UsbBus, UsbDevice,
};
use rusb::{Context, UsbContext};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

type SharedHandle = Arc<Mutex<rusb::DeviceHandle<Context>>>;

impl From<rusb::Error> for UsbError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Access => UsbError::Access,
            rusb::Error::NoDevice | rusb::Error::NotFound => UsbError::NoDevice,
            rusb::Error::Timeout => UsbError::Timeout,
            rusb::Error::Pipe => UsbError::Pipe,
            rusb::Error::Io => UsbError::Io("libusb I/O error".to_string()),
            other => UsbError::Other(other.to_string()),
        }
    }
}

/// Run a blocking libusb call off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, UsbError>
where
    F: FnOnce() -> Result<T, UsbError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UsbError::Other(format!("USB worker failed: {}", e)))?
}

/// Run `f` on the open handle from the blocking pool.
async fn with_handle<T, F>(handle: SharedHandle, f: F) -> Result<T, UsbError>
where
    F: FnOnce(&mut rusb::DeviceHandle<Context>) -> rusb::Result<T> + Send + 'static,
    T: Send + 'static,
{
    blocking(move || {
        let mut guard = handle
            .lock()
            .map_err(|_| UsbError::Other("USB handle lock poisoned".to_string()))?;
        let value = f(&mut *guard)?;
        Ok(value)
    })
    .await
}

/// Enumerates devices through a libusb context.
pub struct RusbBus {
    context: Context,
    transfer_timeout: Duration,
}

impl RusbBus {
    pub fn new(transfer_timeout: Duration) -> Result<Self, UsbError> {
        Ok(Self {
            context: Context::new()?,
            transfer_timeout,
        })
    }
}

impl UsbBus for RusbBus {
    type Device = RusbDevice;

    async fn devices(&self) -> Result<Vec<RusbDevice>, UsbError> {
        let context = self.context.clone();
        let timeout = self.transfer_timeout;

        blocking(move || {
            let mut found = Vec::new();
            for device in context.devices()?.iter() {
                // Devices without a readable descriptor are skipped
                let Ok(desc) = device.device_descriptor() else {
                    continue;
                };
                found.push(RusbDevice {
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    device,
                    handle: None,
                    timeout,
                });
            }
            Ok(found)
        })
        .await
    }
}

pub struct RusbDevice {
    vendor_id: u16,
    product_id: u16,
    device: rusb::Device<Context>,
    handle: Option<SharedHandle>,
    timeout: Duration,
}

impl RusbDevice {
    fn handle(&self) -> Result<SharedHandle, UsbError> {
        self.handle.clone().ok_or(UsbError::NotOpen)
    }
}

fn direction(d: rusb::Direction) -> Direction {
    match d {
        rusb::Direction::In => Direction::In,
        rusb::Direction::Out => Direction::Out,
    }
}

fn transfer_type(t: rusb::TransferType) -> TransferType {
    match t {
        rusb::TransferType::Control => TransferType::Control,
        rusb::TransferType::Isochronous => TransferType::Isochronous,
        rusb::TransferType::Bulk => TransferType::Bulk,
        rusb::TransferType::Interrupt => TransferType::Interrupt,
    }
}

fn configuration_info(config: &rusb::ConfigDescriptor) -> ConfigurationInfo {
    let interfaces = config
        .interfaces()
        .map(|interface| InterfaceInfo {
            number: interface.number(),
            alternates: interface
                .descriptors()
                .map(|alt| AlternateInfo {
                    setting: alt.setting_number(),
                    class_code: alt.class_code(),
                    endpoints: alt
                        .endpoint_descriptors()
                        .map(|ep| EndpointInfo {
                            address: ep.address(),
                            direction: direction(ep.direction()),
                            transfer_type: transfer_type(ep.transfer_type()),
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    ConfigurationInfo {
        value: config.number(),
        interfaces,
    }
}

impl UsbDevice for RusbDevice {
    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn label(&self) -> String {
        format!(
            "{:04x}:{:04x} (bus {:03} address {:03})",
            self.vendor_id,
            self.product_id,
            self.device.bus_number(),
            self.device.address()
        )
    }

    async fn open(&mut self) -> Result<(), UsbError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let device = self.device.clone();
        let handle = blocking(move || {
            let handle = device.open()?;
            // Not every platform supports kernel driver detaching
            if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                debug!("Auto-detach of kernel driver unavailable: {}", e);
            }
            Ok(handle)
        })
        .await?;

        self.handle = Some(Arc::new(Mutex::new(handle)));
        Ok(())
    }

    async fn active_configuration(&self) -> Result<Option<ConfigurationInfo>, UsbError> {
        let handle = self.handle()?;
        let device = self.device.clone();

        // bConfigurationValue 0 means the device is unconfigured
        with_handle(handle, move |h| match h.active_configuration()? {
            0 => Ok(None),
            _ => {
                let config = device.active_config_descriptor()?;
                Ok(Some(configuration_info(&config)))
            }
        })
        .await
    }

    async fn select_configuration(&mut self, value: u8) -> Result<(), UsbError> {
        let handle = self.handle()?;
        with_handle(handle, move |h| h.set_active_configuration(value)).await
    }

    async fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        let handle = self.handle()?;
        with_handle(handle, move |h| h.claim_interface(interface)).await
    }

    async fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        let handle = self.handle()?;
        with_handle(handle, move |h| h.release_interface(interface)).await
    }

    async fn select_alternate_interface(
        &mut self,
        interface: u8,
        setting: u8,
    ) -> Result<(), UsbError> {
        let handle = self.handle()?;
        with_handle(handle, move |h| h.set_alternate_setting(interface, setting)).await
    }

    async fn control_transfer_out(&mut self, request: ClassRequest) -> Result<(), UsbError> {
        let handle = self.handle()?;
        let timeout = self.timeout;
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Class,
            rusb::Recipient::Interface,
        );

        with_handle(handle, move |h| {
            h.write_control(
                request_type,
                request.request,
                request.value,
                request.index,
                &[],
                timeout,
            )
            .map(|_| ())
        })
        .await
    }

    async fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, UsbError> {
        let handle = self.handle()?;
        let timeout = self.timeout;
        let data = data.to_vec();

        with_handle(handle, move |h| h.write_bulk(endpoint, &data, timeout)).await
    }

    async fn transfer_in(&mut self, endpoint: u8, max_len: usize) -> Result<Vec<u8>, UsbError> {
        let handle = self.handle()?;
        let timeout = self.timeout;

        with_handle(handle, move |h| {
            let mut buf = vec![0u8; max_len];
            let nread = h.read_bulk(endpoint, &mut buf, timeout)?;
            buf.truncate(nread);
            Ok(buf)
        })
        .await
    }

    async fn close(&mut self) -> Result<(), UsbError> {
        // libusb closes the device when the last reference to the handle drops
        match self.handle.take() {
            Some(handle) => {
                if Arc::strong_count(&handle) > 1 {
                    warn!("Closing device while a transfer is still in flight");
                }
                Ok(())
            }
            None => Err(UsbError::NotOpen),
        }
    }
}
