use thiserror::Error;

pub type Result<T, E = BusError> = core::result::Result<T, E>;

/// Opaque failure reported by a driver call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("operation not supported on this driver: {0}")]
    Unsupported(&'static str),
    #[error("timeout")]
    Timeout,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("rejected by driver: {0}")]
    Rejected(String),
}

/// Setter steps of the bring-up protocol that can be rejected by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    Bitrate,
    ListenMode,
    ReapplyListenMode,
    ReapplyBitrate,
}

impl core::fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ConfigStep::Bitrate => "set bitrate",
            ConfigStep::ListenMode => "set listen mode",
            ConfigStep::ReapplyListenMode => "re-apply listen mode",
            ConfigStep::ReapplyBitrate => "re-apply bitrate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unable to instantiate driver interface: {0}")]
    DriverUnavailable(#[source] DriverError),
    #[error("configuration rejected at '{step}': {source}")]
    ConfigurationRejected {
        step: ConfigStep,
        #[source]
        source: DriverError,
    },
    #[error("interface create(listen_only={listen_only}) failed: {source}")]
    CreateFailed {
        listen_only: bool,
        #[source]
        source: DriverError,
    },
    #[error("hardware filters rejected: {0}")]
    FilterRejected(#[source] DriverError),
    #[error("socket allocation failed: {0}")]
    SocketAllocationFailed(String),
    #[error("socket open failed: {0}")]
    SocketOpenFailed(#[source] DriverError),
    #[error("discarding socket input buffer failed: {0}")]
    BufferDiscardFailed(#[source] DriverError),
    #[error("interface removal failed: {0}")]
    RemovalFailed(#[source] DriverError),
    #[error("a {0} interface is already live")]
    SlotBusy(crate::BusKind),
    #[error("socket is not open")]
    SocketNotOpen,
    #[error("frame transfer failed: {0}")]
    Transfer(#[source] DriverError),
}

impl BusError {
    /// Stable short name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::DriverUnavailable(_) => "driver_unavailable",
            BusError::ConfigurationRejected { .. } => "configuration_rejected",
            BusError::CreateFailed { .. } => "create_failed",
            BusError::FilterRejected(_) => "filter_rejected",
            BusError::SocketAllocationFailed(_) => "socket_allocation_failed",
            BusError::SocketOpenFailed(_) => "socket_open_failed",
            BusError::BufferDiscardFailed(_) => "buffer_discard_failed",
            BusError::RemovalFailed(_) => "removal_failed",
            BusError::SlotBusy(_) => "slot_busy",
            BusError::SocketNotOpen => "socket_not_open",
            BusError::Transfer(_) => "transfer",
        }
    }
}
