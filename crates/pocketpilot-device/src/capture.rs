//! Screenshot capture with classification and placeholder fallback.
//!
//! Downstream code always needs *some* bitmap to serialize, even when the
//! OS refuses capture, so this module guarantees a bitmap at exactly
//! `screen_size()` on every path and lets the classification decide what
//! the agent may do with it.

use crate::backend::{DeviceBackend, RawScreenshot};
use anyhow::{Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use pocketpilot_core::record::ScreenClass;
use std::io::Cursor;
use tracing::warn;

/// A decoded (or synthesized) frame plus how it came to be.
#[derive(Debug, Clone)]
pub struct CapturedScreen {
    pub image: RgbImage,
    pub width: u32,
    pub height: u32,
    pub classification: ScreenClass,
}

impl CapturedScreen {
    /// True when the agent may send this frame to the model.
    pub fn model_visible(&self) -> bool {
        self.classification != ScreenClass::SensitiveBlocked
    }
}

/// Capture and classify the current screen.
///
/// - Bytes that decode → `Ok` with the decoded bitmap.
/// - Capture refused → `SensitiveBlocked` with a black placeholder.
/// - Bytes that do not decode → `Fallback{reason}` with a black placeholder.
pub async fn capture(backend: &impl DeviceBackend) -> CapturedScreen {
    let (width, height) = backend.screen_size();

    match backend.screenshot().await {
        RawScreenshot::Captured(bytes) => match image::load_from_memory(&bytes) {
            Ok(decoded) => {
                let image = decoded.to_rgb8();
                CapturedScreen {
                    width: image.width(),
                    height: image.height(),
                    image,
                    classification: ScreenClass::Ok,
                }
            }
            Err(e) => {
                warn!(len = bytes.len(), error = %e, "Screenshot bytes did not decode");
                placeholder(
                    width,
                    height,
                    ScreenClass::Fallback {
                        reason: format!("screenshot did not decode: {}", e),
                    },
                )
            }
        },
        RawScreenshot::Refused { reason } => {
            warn!(reason = %reason, "Screen capture refused");
            placeholder(width, height, ScreenClass::SensitiveBlocked)
        }
    }
}

fn placeholder(width: u32, height: u32, classification: ScreenClass) -> CapturedScreen {
    CapturedScreen {
        image: RgbImage::from_pixel(width, height, Rgb([0, 0, 0])),
        width,
        height,
        classification,
    }
}

/// JPEG-encode a frame at quality 70. Resolution is preserved: the model's
/// coordinates refer to the screen, so any resize would bias the action.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, 70);
    encoder
        .encode_image(image)
        .context("Failed to encode screenshot as JPEG")?;
    Ok(buf.into_inner())
}

/// Wrap JPEG bytes as an inline `data:` URL for the model request.
pub fn jpeg_data_url(jpeg: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    )
}

/// Encode and inline in one go.
pub fn encode_jpeg_data_url(image: &RgbImage) -> Result<String> {
    Ok(jpeg_data_url(&encode_jpeg(image)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use pocketpilot_core::record::{DispatchMethod, DispatchOutcome};

    /// Mock back-end returning a scripted screenshot result.
    struct MockDevice {
        size: (u32, u32),
        shot: RawScreenshot,
    }

    impl DeviceBackend for MockDevice {
        fn screen_size(&self) -> (u32, u32) {
            self.size
        }

        async fn screenshot(&self) -> RawScreenshot {
            self.shot.clone()
        }

        async fn tap(&self, _x: i32, _y: i32) -> DispatchOutcome {
            DispatchOutcome::ok(DispatchMethod::Accessibility)
        }

        async fn long_press(&self, _x: i32, _y: i32, _duration_ms: u64) -> DispatchOutcome {
            DispatchOutcome::ok(DispatchMethod::Accessibility)
        }

        async fn swipe(
            &self,
            _x1: i32,
            _y1: i32,
            _x2: i32,
            _y2: i32,
            _duration_ms: u64,
        ) -> DispatchOutcome {
            DispatchOutcome::ok(DispatchMethod::Accessibility)
        }

        async fn input_text(&self, _text: &str, _clear_first: bool) -> DispatchOutcome {
            DispatchOutcome::ok(DispatchMethod::Shell)
        }

        async fn back(&self) -> DispatchOutcome {
            DispatchOutcome::ok(DispatchMethod::System)
        }

        async fn home(&self) -> DispatchOutcome {
            DispatchOutcome::ok(DispatchMethod::System)
        }

        async fn open_app(&self, _package: &str) -> DispatchOutcome {
            DispatchOutcome::ok(DispatchMethod::System)
        }

        async fn open_deep_link(&self, _uri: &str) -> DispatchOutcome {
            DispatchOutcome::ok(DispatchMethod::System)
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn decodable_bytes_classify_ok() {
        let device = MockDevice {
            size: (4, 8),
            shot: RawScreenshot::Captured(png_bytes(4, 8)),
        };
        let screen = capture(&device).await;
        assert_eq!(screen.classification, ScreenClass::Ok);
        assert_eq!((screen.width, screen.height), (4, 8));
        assert!(screen.model_visible());
    }

    #[tokio::test]
    async fn refused_capture_yields_black_placeholder() {
        let device = MockDevice {
            size: (4, 8),
            shot: RawScreenshot::Refused {
                reason: "status -1".to_string(),
            },
        };
        let screen = capture(&device).await;
        assert_eq!(screen.classification, ScreenClass::SensitiveBlocked);
        assert_eq!((screen.width, screen.height), (4, 8));
        assert!(!screen.model_visible());
        assert!(screen.image.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[tokio::test]
    async fn corrupt_bytes_yield_fallback_placeholder() {
        let device = MockDevice {
            size: (6, 6),
            shot: RawScreenshot::Captured(b"not an image".to_vec()),
        };
        let screen = capture(&device).await;
        assert!(matches!(
            screen.classification,
            ScreenClass::Fallback { .. }
        ));
        assert_eq!((screen.width, screen.height), (6, 6));
        assert!(screen.model_visible());
        assert_eq!(screen.image.dimensions(), (6, 6));
    }

    #[test]
    fn jpeg_data_url_round_trips_dimensions() {
        let img = RgbImage::from_pixel(9, 5, Rgb([200, 100, 50]));
        let url = encode_jpeg_data_url(&img).unwrap();
        let b64 = url.strip_prefix("data:image/jpeg;base64,").unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (9, 5));
    }
}
