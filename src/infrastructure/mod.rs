pub mod logging;
pub mod usb;
