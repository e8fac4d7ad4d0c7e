//! # uwb-relay
//!
//! Relays distance measurements from a UWB ranging sensor, received as a
//! framed byte stream over a serial link, to a consumer and optionally on to
//! a second serial-attached controller under rate limiting.
//!
//! ## Crate structure
//!
//! - [`frame`]: `0x02 hi lo 0x03` frame decoder and [`frame::DistanceSample`]
//! - [`gate`]: stabilization gate suppressing warm-up readings
//! - [`slot`]: single-slot latest-value hand-off between threads
//! - [`link`]: serial link manager (open, fault, reopen with backoff)
//! - [`throttle`]: change- and rate-gated downstream forwarder
//! - [`encoder`]: downstream message encoder seam
//! - [`relay`]: receive/forward thread runtime
//! - [`config`]: TOML configuration
//! - [`stats`]: relay counters
//! - [`shutdown`]: cooperative cancellation signal
//! - [`sim`]: simulated sensor and controller ports
//! - `test_util`: scripted in-memory ports for tests (`test-util` feature)
//!
//! ## Data flow
//!
//! ```text
//! sensor ─serial─▶ SerialLink ─▶ FrameDecoder ─▶ StabilizationGate ─▶ LatestSlot
//!                                                                        │
//! controller ◀─serial─ SerialLink ◀─ DownstreamEncoder ◀─ TransmitThrottler
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod gate;
pub mod link;
pub mod relay;
pub mod shutdown;
pub mod sim;
pub mod slot;
pub mod stats;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
pub mod throttle;

pub use config::RelayConfig;
pub use encoder::{DownstreamEncoder, LineEncoder};
pub use error::{ConfigError, FrameError, LinkError, RelayError};
pub use frame::{DistanceSample, FrameDecoder};
pub use gate::StabilizationGate;
pub use link::{LinkState, PortOpener, SerialLink, SerialStream};
pub use relay::{ReceiveSettings, Relay};
pub use shutdown::Shutdown;
pub use slot::LatestSlot;
pub use stats::{RelayStats, StatsSnapshot};
pub use throttle::{ThrottleConfig, TransmitThrottler};
