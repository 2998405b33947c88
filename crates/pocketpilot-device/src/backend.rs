use pocketpilot_core::record::{DispatchMethod, DispatchOutcome};
use std::future::Future;

/// Raw result of a screenshot attempt, before decoding.
#[derive(Debug, Clone)]
pub enum RawScreenshot {
    /// Encoded image bytes (PNG or JPEG, back-end dependent).
    Captured(Vec<u8>),
    /// The platform refused capture, e.g. a FLAG_SECURE window or a
    /// negative status code from the capture service.
    Refused { reason: String },
}

/// Seam to whatever actually drives the device, allowing mock back-ends in
/// tests. Two real implementations are expected: an accessibility-gesture
/// back-end and a shell-injection one.
///
/// Dispatch methods never error at the trait level; failure is carried in
/// the returned outcome's `ok` flag and the agent treats it as a
/// recoverable signal. A back-end performs its own internal fallback and
/// reports the method that actually serviced the call.
pub trait DeviceBackend: Send + Sync {
    /// Current screen dimensions in pixels, orientation resolved.
    fn screen_size(&self) -> (u32, u32);

    fn screenshot(&self) -> impl Future<Output = RawScreenshot> + Send;

    fn tap(&self, x: i32, y: i32) -> impl Future<Output = DispatchOutcome> + Send;

    /// Tap a logical accessibility element by index. Capability is
    /// negotiated per operation: back-ends without a node tree keep this
    /// default, which reports the operation unsupported.
    fn tap_element(&self, index: u32) -> impl Future<Output = DispatchOutcome> + Send {
        async move {
            DispatchOutcome::failed(
                DispatchMethod::System,
                format!("element target {} not supported by this back-end", index),
            )
        }
    }

    fn long_press(
        &self,
        x: i32,
        y: i32,
        duration_ms: u64,
    ) -> impl Future<Output = DispatchOutcome> + Send;

    fn swipe(
        &self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    ) -> impl Future<Output = DispatchOutcome> + Send;

    /// Focuses the current input target first; `clear_first` is honored on
    /// a best-effort basis.
    fn input_text(
        &self,
        text: &str,
        clear_first: bool,
    ) -> impl Future<Output = DispatchOutcome> + Send;

    fn back(&self) -> impl Future<Output = DispatchOutcome> + Send;

    fn home(&self) -> impl Future<Output = DispatchOutcome> + Send;

    /// `package` is a resolved package id, not a display name.
    fn open_app(&self, package: &str) -> impl Future<Output = DispatchOutcome> + Send;

    fn open_deep_link(&self, uri: &str) -> impl Future<Output = DispatchOutcome> + Send;
}
