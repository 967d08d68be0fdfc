//! In-memory USB doubles for tests.

use crate::domain::error::{ProvisionError, UsbError};
use crate::infrastructure::usb::chooser::{Candidate, DeviceChooser};
use crate::infrastructure::usb::{
    AlternateInfo, ClassRequest, ConfigurationInfo, DeviceFilter, DeviceRegistry, Direction,
    EndpointInfo, InterfaceInfo, TransferType, TransportDescriptor, UsbBus, UsbDevice,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Open,
    ActiveConfiguration,
    SelectConfiguration(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    SelectAlternate(u8, u8),
    Control(ClassRequest),
    TransferOut(u8, Vec<u8>),
    TransferIn(u8, usize),
    Close,
}

/// Failures and responses a test wants the device to produce.
#[derive(Debug, Default)]
pub struct Script {
    pub fail_open: Option<UsbError>,
    pub fail_control: Option<UsbError>,
    pub fail_transfer_out: Option<UsbError>,
    pub fail_transfer_in: Option<UsbError>,
    pub fail_close: Option<UsbError>,
    pub responses: VecDeque<Vec<u8>>,
    /// Never complete a bulk IN
    pub hang_receive: bool,
}

#[derive(Debug, Default)]
struct Inner {
    ops: Vec<Op>,
    configured: bool,
    open: bool,
}

#[derive(Debug, Clone)]
pub struct Journal(Arc<Mutex<Inner>>);

impl Journal {
    pub fn ops(&self) -> Vec<Op> {
        self.0.lock().unwrap().ops.clone()
    }

    pub fn count(&self, matcher: impl Fn(&Op) -> bool) -> usize {
        self.0.lock().unwrap().ops.iter().filter(|op| matcher(op)).count()
    }

    pub fn is_open(&self) -> bool {
        self.0.lock().unwrap().open
    }
}

#[derive(Debug, Clone)]
pub struct MockDevice {
    vendor_id: u16,
    product_id: u16,
    config: ConfigurationInfo,
    inner: Arc<Mutex<Inner>>,
    script: Arc<Mutex<Script>>,
}

impl MockDevice {
    /// A board exposing the firmware channel the way the Arduino WebUSB library does.
    pub fn arduino() -> Self {
        Self::with_ids(0x2341, 0x8036)
    }

    pub fn with_ids(vendor_id: u16, product_id: u16) -> Self {
        let config = ConfigurationInfo {
            value: 1,
            interfaces: vec![
                InterfaceInfo {
                    number: 0,
                    alternates: vec![AlternateInfo {
                        setting: 0,
                        class_code: 0x02,
                        endpoints: vec![EndpointInfo {
                            address: 0x81,
                            direction: Direction::In,
                            transfer_type: TransferType::Interrupt,
                        }],
                    }],
                },
                InterfaceInfo {
                    number: 2,
                    alternates: vec![AlternateInfo {
                        setting: 0,
                        class_code: 0xff,
                        endpoints: vec![
                            EndpointInfo {
                                address: 0x84,
                                direction: Direction::In,
                                transfer_type: TransferType::Bulk,
                            },
                            EndpointInfo {
                                address: 0x04,
                                direction: Direction::Out,
                                transfer_type: TransferType::Bulk,
                            },
                        ],
                    }],
                },
            ],
        };

        Self {
            vendor_id,
            product_id,
            config,
            inner: Arc::new(Mutex::new(Inner {
                configured: true,
                ..Default::default()
            })),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    pub fn unconfigured(self) -> Self {
        self.inner.lock().unwrap().configured = false;
        self
    }

    pub fn without_vendor_interface(mut self) -> Self {
        for interface in &mut self.config.interfaces {
            for alternate in &mut interface.alternates {
                if alternate.class_code == 0xff {
                    alternate.class_code = 0x0a;
                }
            }
        }
        self
    }

    pub fn without_in_endpoint(mut self) -> Self {
        for interface in &mut self.config.interfaces {
            if interface.number == 2 {
                for alternate in &mut interface.alternates {
                    alternate.endpoints.retain(|e| e.direction != Direction::In);
                }
            }
        }
        self
    }

    pub fn journal(&self) -> Journal {
        Journal(self.inner.clone())
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    fn record(&self, op: Op) {
        self.inner.lock().unwrap().ops.push(op);
    }

    fn ensure_open(&self) -> Result<(), UsbError> {
        if self.inner.lock().unwrap().open {
            Ok(())
        } else {
            Err(UsbError::NotOpen)
        }
    }
}

impl UsbDevice for MockDevice {
    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    async fn open(&mut self) -> Result<(), UsbError> {
        self.record(Op::Open);
        if let Some(e) = self.script.lock().unwrap().fail_open.clone() {
            return Err(e);
        }
        self.inner.lock().unwrap().open = true;
        Ok(())
    }

    async fn active_configuration(&self) -> Result<Option<ConfigurationInfo>, UsbError> {
        self.record(Op::ActiveConfiguration);
        self.ensure_open()?;
        if self.inner.lock().unwrap().configured {
            Ok(Some(self.config.clone()))
        } else {
            Ok(None)
        }
    }

    async fn select_configuration(&mut self, value: u8) -> Result<(), UsbError> {
        self.record(Op::SelectConfiguration(value));
        self.ensure_open()?;
        self.inner.lock().unwrap().configured = value == self.config.value;
        Ok(())
    }

    async fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.record(Op::ClaimInterface(interface));
        self.ensure_open()
    }

    async fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.record(Op::ReleaseInterface(interface));
        self.ensure_open()
    }

    async fn select_alternate_interface(
        &mut self,
        interface: u8,
        setting: u8,
    ) -> Result<(), UsbError> {
        self.record(Op::SelectAlternate(interface, setting));
        self.ensure_open()
    }

    async fn control_transfer_out(&mut self, request: ClassRequest) -> Result<(), UsbError> {
        self.record(Op::Control(request));
        self.ensure_open()?;
        match self.script.lock().unwrap().fail_control.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, UsbError> {
        self.record(Op::TransferOut(endpoint, data.to_vec()));
        self.ensure_open()?;
        match self.script.lock().unwrap().fail_transfer_out.clone() {
            Some(e) => Err(e),
            None => Ok(data.len()),
        }
    }

    async fn transfer_in(&mut self, endpoint: u8, max_len: usize) -> Result<Vec<u8>, UsbError> {
        self.record(Op::TransferIn(endpoint, max_len));
        self.ensure_open()?;

        let (hang, next) = {
            let mut script = self.script.lock().unwrap();
            if let Some(e) = script.fail_transfer_in.clone() {
                return Err(e);
            }
            (script.hang_receive, script.responses.pop_front())
        };

        if hang {
            std::future::pending::<()>().await;
        }

        match next {
            Some(mut bytes) => {
                bytes.truncate(max_len);
                Ok(bytes)
            }
            None => Err(UsbError::Timeout),
        }
    }

    async fn close(&mut self) -> Result<(), UsbError> {
        self.record(Op::Close);
        self.inner.lock().unwrap().open = false;
        match self.script.lock().unwrap().fail_close.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Devices "plugged into" a fake host.
#[derive(Debug, Default)]
pub struct MockBus {
    pub devices: Mutex<Vec<MockDevice>>,
    pub fail: Mutex<Option<UsbError>>,
}

impl MockBus {
    pub fn with_devices(devices: Vec<MockDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            fail: Mutex::new(None),
        }
    }
}

impl UsbBus for MockBus {
    type Device = MockDevice;

    async fn devices(&self) -> Result<Vec<MockDevice>, UsbError> {
        if let Some(e) = self.fail.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.devices.lock().unwrap().clone())
    }
}

/// Chooser returning a fixed answer and remembering what it was shown.
#[derive(Debug)]
pub struct ScriptedChooser {
    answer: Result<Option<usize>, UsbError>,
    pub shown: Mutex<Vec<Candidate>>,
    /// Thread the last prompt ran on
    pub thread: Mutex<Option<ThreadId>>,
}

impl ScriptedChooser {
    pub fn pick(index: usize) -> Self {
        Self {
            answer: Ok(Some(index)),
            shown: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
        }
    }

    pub fn cancel() -> Self {
        Self {
            answer: Ok(None),
            shown: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
        }
    }

    pub fn refuse(error: UsbError) -> Self {
        Self {
            answer: Err(error),
            shown: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
        }
    }
}

impl DeviceChooser for ScriptedChooser {
    fn choose(&self, candidates: &[Candidate]) -> Result<Option<usize>, ProvisionError> {
        *self.shown.lock().unwrap() = candidates.to_vec();
        *self.thread.lock().unwrap() = Some(std::thread::current().id());
        self.answer.clone().map_err(ProvisionError::Transport)
    }
}

/// Registry double returning canned descriptors.
#[derive(Debug, Default)]
pub struct CannedRegistry {
    pub authorized: Mutex<Vec<MockDevice>>,
    pub requestable: Mutex<Option<MockDevice>>,
    pub request_error: Mutex<Option<UsbError>>,
    pub requests: Mutex<usize>,
}

impl CannedRegistry {
    pub fn with_authorized(devices: Vec<MockDevice>) -> Self {
        Self {
            authorized: Mutex::new(devices),
            ..Default::default()
        }
    }

    pub fn with_requestable(device: MockDevice) -> Self {
        Self {
            requestable: Mutex::new(Some(device)),
            ..Default::default()
        }
    }
}

impl DeviceRegistry for CannedRegistry {
    type Device = MockDevice;

    async fn list_authorized(&self) -> Vec<TransportDescriptor<MockDevice>> {
        self.authorized
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(TransportDescriptor::new)
            .collect()
    }

    async fn request_new(
        &self,
        _filters: &[DeviceFilter],
    ) -> Result<Option<TransportDescriptor<MockDevice>>, ProvisionError> {
        *self.requests.lock().unwrap() += 1;
        if let Some(e) = self.request_error.lock().unwrap().clone() {
            return Err(ProvisionError::Transport(e));
        }
        Ok(self
            .requestable
            .lock()
            .unwrap()
            .clone()
            .map(TransportDescriptor::new))
    }
}
