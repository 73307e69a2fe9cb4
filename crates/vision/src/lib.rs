//! Chart capture and signal detection.
//!
//! The capturer shells out to a screenshot program; the detector sends the
//! resulting PNG to a hosted `generateContent` vision endpoint and reduces
//! the reply to a [`ChartSignal`](sigtrade_core::ChartSignal).

pub mod capture;
pub mod detector;

pub use capture::{CaptureConfig, CaptureError, ChartCapturer};
pub use detector::{SignalDetector, VisionConfig, VisionError};
