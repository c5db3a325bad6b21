//! Tor daemon interaction
//!
//! Control port transport, reply framing and the typed views of what the
//! daemon reports. Tor itself is treated as a black box.

pub mod circuit;
pub mod control;
pub mod events;
pub mod protocol;

pub use circuit::{CircuitRecord, RelayId};
pub use control::{ControlAuth, ControlChannel};
pub use events::{BootstrapPhase, Severity, TorEvent};
pub use protocol::{ControlEvent, ControlResponse};
