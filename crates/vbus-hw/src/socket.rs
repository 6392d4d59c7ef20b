use tracing::{debug, error};

use crate::lifecycle::{InterfaceHandle, InterfaceInfo};
use crate::{BusError, CanFrame, DriverError, DriverInterface, DriverSocket, J1708Frame, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Open,
}

/// Endpoint bound to one interface for its whole life. The binding is recorded by
/// value and does not keep the interface alive.
pub struct BusSocket<S: DriverSocket> {
    inner: Option<S>,
    state: SocketState,
    bound: InterfaceInfo,
}

impl<I: DriverInterface> InterfaceHandle<I> {
    pub fn create_socket(&mut self) -> Result<BusSocket<I::Socket>> {
        BusSocket::create(self)
    }
}

impl<S: DriverSocket> BusSocket<S> {
    /// Allocate an endpoint on a live interface. A torn-down handle, a driver error
    /// and a driver that hands back nothing all fail.
    pub fn create<I>(handle: &mut InterfaceHandle<I>) -> Result<Self>
    where
        I: DriverInterface<Socket = S>,
    {
        let bound = handle.info();
        let iface = handle.interface_mut().ok_or_else(|| {
            error!("Socket requested on a removed interface");
            BusError::SocketAllocationFailed("interface is not live".into())
        })?;
        match iface.create_socket() {
            Ok(Some(sock)) => Ok(Self {
                inner: Some(sock),
                state: SocketState::Closed,
                bound,
            }),
            Ok(None) => {
                error!("Socket not created .. driver returned nothing");
                Err(BusError::SocketAllocationFailed(
                    "driver returned no socket".into(),
                ))
            }
            Err(e) => {
                error!("Exception creating socket: {e}");
                Err(BusError::SocketAllocationFailed(e.to_string()))
            }
        }
    }

    /// Open the endpoint. Discarding the input buffer drops frames buffered at a
    /// previous bitrate but stalls reception for a few seconds, so it is opt-in.
    /// A discard failure leaves the socket open.
    pub fn open(&mut self, discard_input_buffer: bool) -> Result<()> {
        let sock = self.inner.as_mut().ok_or_else(|| {
            BusError::SocketOpenFailed(DriverError::Rejected("socket was closed".into()))
        })?;
        sock.open().map_err(|e| {
            error!("Exception opening socket: {e}");
            BusError::SocketOpenFailed(e)
        })?;
        self.state = SocketState::Open;

        if discard_input_buffer {
            sock.discard_in_buffer().map_err(|e| {
                error!("Exception discarding socket buffer: {e}");
                BusError::BufferDiscardFailed(e)
            })?;
            debug!("socket input buffer discarded");
        }
        Ok(())
    }

    /// Close if open. The socket is unusable afterwards even if the driver
    /// reports an error.
    pub fn close(&mut self) {
        if let Some(mut sock) = self.inner.take() {
            if self.state == SocketState::Open {
                if let Err(e) = sock.close() {
                    error!("Exception closing socket: {e}");
                }
            }
        }
        self.state = SocketState::Closed;
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SocketState::Open
    }

    /// The interface this socket was allocated on.
    pub fn bound(&self) -> InterfaceInfo {
        self.bound
    }

    fn open_socket(&mut self) -> Result<&mut S> {
        match (self.state, self.inner.as_mut()) {
            (SocketState::Open, Some(sock)) => Ok(sock),
            _ => Err(BusError::SocketNotOpen),
        }
    }

    pub fn read_can(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        self.open_socket()?
            .read(timeout_ms)
            .map_err(BusError::Transfer)
    }

    pub fn write_can(&mut self, frame: &CanFrame) -> Result<()> {
        self.open_socket()?.write(frame).map_err(BusError::Transfer)
    }

    pub fn read_j1708(&mut self, timeout_ms: Option<u64>) -> Result<J1708Frame> {
        self.open_socket()?
            .read_j1708(timeout_ms)
            .map_err(BusError::Transfer)
    }

    pub fn write_j1708(&mut self, frame: &J1708Frame) -> Result<()> {
        self.open_socket()?
            .write_j1708(frame)
            .map_err(BusError::Transfer)
    }
}

impl<S: DriverSocket> Drop for BusSocket<S> {
    fn drop(&mut self) {
        self.close();
    }
}
