//! Transport Descriptor Registry
//!
//! Lists devices the user has already paired and runs the pairing flow for
//! new ones, restricted to the vendor allow-list.

use crate::domain::error::{ProvisionError, UsbError};
use crate::domain::models::{AppEvent, MessageSeverity, StatusMessage};
use crate::domain::settings::SettingsService;
use crate::infrastructure::usb::chooser::{Candidate, DeviceChooser};
use crate::infrastructure::usb::protocol::is_allowed_vendor;
use crate::infrastructure::usb::{
    DeviceFilter, DeviceRegistry, TransportDescriptor, UsbBus, UsbDevice,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Registry backed by a USB bus, a chooser and the persisted authorization list.
pub struct UsbRegistry<B, C> {
    bus: B,
    chooser: Arc<C>,
    settings: Arc<Mutex<SettingsService>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<B: UsbBus, C: DeviceChooser + 'static> UsbRegistry<B, C> {
    pub fn new(
        bus: B,
        chooser: C,
        settings: Arc<Mutex<SettingsService>>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            bus,
            chooser: Arc::new(chooser),
            settings,
            event_sender,
        }
    }

    async fn attached(&self) -> Vec<B::Device> {
        match self.bus.devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                Vec::new()
            }
        }
    }

    /// Prompts block on user input, so the chooser runs on the blocking pool.
    async fn choose(&self, candidates: Vec<Candidate>) -> Result<Option<usize>, ProvisionError> {
        let chooser = self.chooser.clone();
        tokio::task::spawn_blocking(move || chooser.choose(&candidates))
            .await
            .map_err(|e| ProvisionError::Transport(UsbError::Other(format!("Chooser failed: {}", e))))?
    }

    fn is_authorized(&self, vendor_id: u16, product_id: u16) -> bool {
        match self.settings.lock() {
            Ok(settings) => settings.is_authorized(vendor_id, product_id),
            Err(_) => false,
        }
    }

    fn remember(&self, vendor_id: u16, product_id: u16) {
        let result = self
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))
            .and_then(|mut settings| settings.authorize(vendor_id, product_id));
        if let Err(e) = result {
            warn!("Failed to persist device authorization: {}", e);
        }
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

/// Drop filters naming vendors outside the allow-list.
fn restrict_to_allow_list(filters: &[DeviceFilter]) -> Vec<DeviceFilter> {
    filters
        .iter()
        .filter(|f| {
            let allowed = is_allowed_vendor(f.vendor_id);
            if !allowed {
                warn!("Ignoring filter for vendor {:04x}: not allow-listed", f.vendor_id);
            }
            allowed
        })
        .copied()
        .collect()
}

impl<B: UsbBus, C: DeviceChooser + 'static> DeviceRegistry for UsbRegistry<B, C> {
    type Device = B::Device;

    async fn list_authorized(&self) -> Vec<TransportDescriptor<B::Device>> {
        let descriptors: Vec<_> = self
            .attached()
            .await
            .into_iter()
            .filter(|d| {
                is_allowed_vendor(d.vendor_id()) && self.is_authorized(d.vendor_id(), d.product_id())
            })
            .map(TransportDescriptor::new)
            .collect();

        debug!("Found {} authorized device(s)", descriptors.len());
        descriptors
    }

    async fn request_new(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Option<TransportDescriptor<B::Device>>, ProvisionError> {
        let filters = restrict_to_allow_list(filters);

        let mut matching: Vec<B::Device> = self
            .attached()
            .await
            .into_iter()
            .filter(|d| filters.iter().any(|f| f.matches(d.vendor_id(), d.product_id())))
            .collect();

        if matching.is_empty() {
            info!("No compatible device attached");
            self.send_log("No compatible device found", MessageSeverity::Warning);
            return Ok(None);
        }

        let candidates: Vec<Candidate> = matching
            .iter()
            .map(|d| Candidate {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                label: d.label(),
            })
            .collect();

        let Some(index) = self.choose(candidates).await? else {
            info!("Device selection cancelled");
            return Ok(None);
        };
        if index >= matching.len() {
            return Ok(None);
        }

        let device = matching.swap_remove(index);
        self.remember(device.vendor_id(), device.product_id());
        info!("Paired with {}", device.label());

        Ok(Some(TransportDescriptor::new(device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::Settings;
    use crate::infrastructure::usb::mock::{MockBus, MockDevice, ScriptedChooser};
    use crate::infrastructure::usb::protocol::{default_filters, ALLOWED_VENDORS};

    fn registry(
        devices: Vec<MockDevice>,
        chooser: ScriptedChooser,
    ) -> UsbRegistry<MockBus, ScriptedChooser> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let settings = Arc::new(Mutex::new(SettingsService::in_memory(Settings::default())));
        UsbRegistry::new(MockBus::with_devices(devices), chooser, settings, tx)
    }

    #[tokio::test]
    async fn test_request_new_per_allowed_vendor() {
        for vendor in ALLOWED_VENDORS {
            let filter = [DeviceFilter::vendor(vendor)];

            let matching = registry(vec![MockDevice::with_ids(vendor, 0x0001)], ScriptedChooser::pick(0));
            let found = matching.request_new(&filter).await.unwrap();
            assert_eq!(found.map(|d| d.vendor_id()), Some(vendor));

            for other in ALLOWED_VENDORS.iter().copied().filter(|v| *v != vendor) {
                let mismatched = registry(vec![MockDevice::with_ids(other, 0x0001)], ScriptedChooser::pick(0));
                assert!(mismatched.request_new(&filter).await.unwrap().is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_request_new_ignores_unlisted_vendor() {
        let registry = registry(vec![MockDevice::with_ids(0x1234, 0x0001)], ScriptedChooser::pick(0));

        let filter = [DeviceFilter::vendor(0x1234)];
        assert!(registry.request_new(&filter).await.unwrap().is_none());
        assert!(registry.request_new(&default_filters()).await.unwrap().is_none());
        assert!(registry.chooser.shown.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_new_shows_only_matching_candidates() {
        let registry = registry(
            vec![
                MockDevice::with_ids(0x1234, 0x0001),
                MockDevice::with_ids(0x303a, 0x1001),
                MockDevice::with_ids(0x239a, 0x8029),
            ],
            ScriptedChooser::pick(1),
        );

        let found = registry.request_new(&default_filters()).await.unwrap().unwrap();
        assert_eq!(found.vendor_id(), 0x239a);

        let shown = registry.chooser.shown.lock().unwrap();
        let vendors: Vec<u16> = shown.iter().map(|c| c.vendor_id).collect();
        assert_eq!(vendors, vec![0x303a, 0x239a]);
    }

    #[tokio::test]
    async fn test_chooser_runs_off_the_async_thread() {
        let registry = registry(vec![MockDevice::arduino()], ScriptedChooser::pick(0));
        assert!(registry.request_new(&default_filters()).await.unwrap().is_some());

        let chooser_thread = registry.chooser.thread.lock().unwrap().unwrap();
        assert_ne!(chooser_thread, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_request_new_cancelled_returns_none() {
        let registry = registry(vec![MockDevice::arduino()], ScriptedChooser::cancel());
        assert!(registry.request_new(&default_filters()).await.unwrap().is_none());
        assert!(registry.list_authorized().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_new_without_gesture_is_transport_error() {
        let registry = registry(
            vec![MockDevice::arduino()],
            ScriptedChooser::refuse(UsbError::UserGestureRequired),
        );
        let err = registry.request_new(&default_filters()).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Transport(UsbError::UserGestureRequired)
        ));
    }

    #[tokio::test]
    async fn test_paired_device_becomes_authorized() {
        let registry = registry(
            vec![MockDevice::arduino(), MockDevice::with_ids(0x303a, 0x1001)],
            ScriptedChooser::pick(0),
        );
        assert!(registry.list_authorized().await.is_empty());

        registry.request_new(&default_filters()).await.unwrap().unwrap();

        let authorized = registry.list_authorized().await;
        assert_eq!(authorized.len(), 1);
        assert_eq!(authorized[0].vendor_id(), 0x2341);
        assert_eq!(authorized[0].product_id(), 0x8036);
    }

    #[tokio::test]
    async fn test_enumeration_failure_lists_nothing() {
        let registry = registry(vec![MockDevice::arduino()], ScriptedChooser::pick(0));
        registry
            .settings
            .lock()
            .unwrap()
            .authorize(0x2341, 0x8036)
            .unwrap();
        *registry.bus.fail.lock().unwrap() = Some(UsbError::Io("busy".to_string()));

        assert!(registry.list_authorized().await.is_empty());
        assert!(registry.request_new(&default_filters()).await.unwrap().is_none());
    }
}
