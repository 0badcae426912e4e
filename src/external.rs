//! External Collaborators - Consumed Interfaces Only
//!
//! The background-removal model, the chat-notification bridge and the rest
//! of the surrounding product are opaque capabilities behind traits. Mock
//! implementations live here too so the pipeline is testable without a
//! network.

use crossbeam_channel::{bounded, RecvTimeoutError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BackgroundRemovalError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Background removal timed out after {0:?}")]
    Timeout(Duration),

    #[error("Background removal failed: {0}")]
    Failed(String),
}

/// Accepts encoded image bytes, returns an image with an alpha channel.
/// May block for seconds; always call through
/// [`remove_background_with_timeout`].
pub trait BackgroundRemover: Send + Sync {
    fn remove_background(
        &self,
        image_bytes: &[u8],
        model: &str,
    ) -> Result<Vec<u8>, BackgroundRemovalError>;
}

/// Invoke the remover with a hard deadline. The underlying call may outlive
/// the timeout on its own thread; its result is then discarded.
pub fn remove_background_with_timeout(
    remover: Arc<dyn BackgroundRemover>,
    image_bytes: Vec<u8>,
    model: String,
    timeout: Duration,
) -> Result<Vec<u8>, BackgroundRemovalError> {
    let (tx, rx) = bounded(1);
    std::thread::spawn(move || {
        let result = remover.remove_background(&image_bytes, &model);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(BackgroundRemovalError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(BackgroundRemovalError::Failed(
            "background removal worker dropped".to_string(),
        )),
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Fire-and-forget event sink. Failures here must never affect record
/// state; use [`notify_best_effort`].
pub trait NotificationSink: Send + Sync {
    fn notify(
        &self,
        event_name: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<(), NotifyError>;
}

/// Deliver and swallow: a down chat bridge only earns a warning.
pub fn notify_best_effort(
    sink: &dyn NotificationSink,
    event_name: &str,
    context: &BTreeMap<String, String>,
) {
    if let Err(e) = sink.notify(event_name, context) {
        warn!(event = event_name, error = %e, "notification dropped");
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn notify(&self, _: &str, _: &BTreeMap<String, String>) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Remover that decodes the input, forces full alpha on near-white pixels
/// to zero and re-encodes as PNG. Good enough to drive the pipeline in
/// tests and local runs without the model server.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockBackgroundRemover;

impl BackgroundRemover for MockBackgroundRemover {
    fn remove_background(
        &self,
        image_bytes: &[u8],
        _model: &str,
    ) -> Result<Vec<u8>, BackgroundRemovalError> {
        let img = image::load_from_memory(image_bytes)
            .map_err(|e| BackgroundRemovalError::Failed(e.to_string()))?;
        let mut rgba = img.to_rgba8();
        for pixel in rgba.pixels_mut() {
            if pixel[0] > 245 && pixel[1] > 245 && pixel[2] > 245 {
                pixel[3] = 0;
            }
        }

        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(rgba)
            .write_to(&mut buf, image::ImageFormat::Png)
            .map_err(|e| BackgroundRemovalError::Failed(e.to_string()))?;
        Ok(buf.into_inner())
    }
}
