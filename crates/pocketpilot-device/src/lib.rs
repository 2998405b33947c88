pub mod backend;
pub mod capture;

pub use backend::{DeviceBackend, RawScreenshot};
pub use capture::{CapturedScreen, capture, encode_jpeg, encode_jpeg_data_url, jpeg_data_url};
