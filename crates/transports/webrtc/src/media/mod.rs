//! Media tracks: inbound camera video and outbound relays to monitors

pub mod inbound;
pub(crate) mod outbound;

pub use inbound::{CaptureClock, DEFAULT_VIDEO_CLOCK_RATE};
