use crate::diagnostics::{CanCounters, J1708Counters};
use crate::{CanFrame, DriverError, HardwareFilter, J1708Frame};

pub type DriverResult<T> = core::result::Result<T, DriverError>;

/// Entry point into a vendor bus driver. The driver holds process-wide state, so
/// each call to [`BusDriver::new_interface`] hands out a fresh, unconfigured
/// interface object that the caller owns.
pub trait BusDriver {
    type Interface: DriverInterface;

    /// Instantiate a driver interface object. Nothing is created on the bus yet.
    fn new_interface(&self) -> DriverResult<Self::Interface>;
}

/// One physical interface as the driver sees it. Every call is fallible.
pub trait DriverInterface {
    type Socket: DriverSocket;

    fn set_bitrate(&mut self, kbps: u32) -> DriverResult<()>;

    fn set_listening_mode(&mut self, listen_only: bool) -> DriverResult<()>;

    /// Create the interface on the hardware.
    fn create(&mut self, listen_only: bool) -> DriverResult<()>;

    fn set_filters(&mut self, filters: &[HardwareFilter]) -> DriverResult<()>;

    fn remove(&mut self) -> DriverResult<()>;

    /// Allocate a communication endpoint. `Ok(None)` means the driver returned
    /// nothing without reporting an error.
    fn create_socket(&mut self) -> DriverResult<Option<Self::Socket>>;

    fn is_j1708_supported(&self) -> DriverResult<bool>;

    fn can_info(&mut self) -> DriverResult<CanCounters>;

    fn j1708_info(&mut self) -> DriverResult<J1708Counters>;
}

/// A communication endpoint bound to a created interface.
pub trait DriverSocket {
    fn open(&mut self) -> DriverResult<()>;

    fn discard_in_buffer(&mut self) -> DriverResult<()>;

    fn close(&mut self) -> DriverResult<()>;

    /// Receive one CAN frame (blocking with optional timeout in milliseconds).
    fn read(&mut self, timeout_ms: Option<u64>) -> DriverResult<CanFrame>;

    fn write(&mut self, frame: &CanFrame) -> DriverResult<()>;

    fn read_j1708(&mut self, _timeout_ms: Option<u64>) -> DriverResult<J1708Frame> {
        Err(DriverError::Unsupported("J1708 not supported"))
    }

    fn write_j1708(&mut self, _frame: &J1708Frame) -> DriverResult<()> {
        Err(DriverError::Unsupported("J1708 not supported"))
    }
}
