//! Outbound delivery capability used by the dispatcher.
//!
//! The dispatcher only ever talks to [`MessageTransport`]. [`GatewayTransport`]
//! speaks to the HTTP messaging gateway; [`RecordingTransport`] keeps every
//! call in memory and can be scripted to fail, for tests and dry runs.

pub mod error;
pub mod gateway;
pub mod recording;
pub mod transport;

pub use {
    error::{Error, Result},
    gateway::{GatewayConfig, GatewayTransport},
    recording::{RecordedCall, RecordingTransport},
    transport::{Delivery, MessageTransport},
};
