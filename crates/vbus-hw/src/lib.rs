//! vbus-hw: vehicle bus interface access layer
//!
//! Brings a CAN (and optionally J1708) interface up through an ordered,
//! failure-aware configuration sequence, manages sockets on top of it and reads
//! hardware counters. Drivers plug in through [`BusDriver`]; the default build
//! enables a recording `mock` driver so that binaries and tests run on any host.

mod types;
pub use types::{
    describe_filters, BusInfo, BusKind, CanFrame, CanFrameType, CanId, HardwareFilter,
    J1708Frame, Timestamp, J1708_MAX_PAYLOAD,
};

mod error;
pub use error::{BusError, ConfigStep, DriverError, Result};

mod traits;
pub use traits::{BusDriver, DriverInterface, DriverResult, DriverSocket};

pub mod diagnostics;
pub use diagnostics::{CanCounters, CounterSnapshot, J1708Counters};

mod lifecycle;
pub use lifecycle::{
    is_j1708_supported, InterfaceHandle, InterfaceInfo, InterfaceLifecycle, SlotState,
};

mod socket;
pub use socket::{BusSocket, SocketState};

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "mock")]
pub use mock::MockDriver;

#[cfg(feature = "slcan")]
mod slcan;

#[cfg(feature = "slcan")]
pub use slcan::{SlcanBitrate, SlcanDriver, SlcanInterface, SlcanSocket};

#[cfg(feature = "metrics")]
mod metrics;

#[cfg(feature = "metrics")]
pub use metrics::{BusMetrics, MetricsHub};
