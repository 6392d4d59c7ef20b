use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::diagnostics::{CanCounters, J1708Counters};
use crate::traits::DriverResult;
use crate::{
    BusDriver, BusInfo, CanFrame, CanId, DriverError, DriverInterface, DriverSocket,
    HardwareFilter, J1708Frame, Timestamp,
};

/// Every call the mock driver has seen, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    NewInterface,
    SetBitrate(u32),
    SetListeningMode(bool),
    Create(bool),
    SetFilters(Vec<HardwareFilter>),
    Remove,
    CreateSocket,
    Open,
    DiscardInBuffer,
    Close,
    CanInfo,
    J1708Info,
    J1708Probe,
}

/// When a repeatable call should fail. `Nth` counts calls of that kind from 1
/// across the whole driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailOn {
    #[default]
    Never,
    Always,
    Nth(usize),
}

impl FailOn {
    fn hits(self, call_no: usize) -> bool {
        match self {
            FailOn::Never => false,
            FailOn::Always => true,
            FailOn::Nth(n) => n == call_no,
        }
    }
}

/// How `create_socket` answers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SocketAlloc {
    #[default]
    Ok,
    Null,
    Error,
}

#[derive(Clone, Debug, Default)]
pub struct MockFaults {
    pub new_interface: bool,
    pub set_bitrate: FailOn,
    pub set_listening_mode: FailOn,
    pub create: bool,
    /// Index of the filter whose installation the hardware rejects.
    pub filter_at: Option<usize>,
    pub remove: bool,
    pub socket: SocketAlloc,
    pub open: bool,
    pub discard: bool,
    pub close: bool,
    pub info: bool,
}

#[derive(Default)]
struct MockState {
    calls: Vec<DriverCall>,
    faults: MockFaults,
    j1708_supported: bool,
    heartbeat: Option<CanId>,
    rx_can: VecDeque<CanFrame>,
    rx_j1708: VecDeque<J1708Frame>,
    tx_can: Vec<CanFrame>,
    tx_j1708: Vec<J1708Frame>,
    rx_delivered: u32,
    live_interfaces: usize,
    bitrate_calls: usize,
    mode_calls: usize,
    bitrate_kbps: Option<u32>,
    listen_only: Option<bool>,
}

/// In-process fixture driver. Clones share state, so a test can keep one clone
/// to inspect what the lifecycle did with another.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: MockFaults) -> Self {
        let driver = Self::default();
        driver.set_faults(faults);
        driver
    }

    /// Emit this frame whenever the receive queue is empty.
    pub fn with_heartbeat(self, id: CanId) -> Self {
        lock(&self.state).heartbeat = Some(id);
        self
    }

    pub fn list() -> Vec<BusInfo> {
        vec![BusInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }]
    }

    pub fn set_faults(&self, faults: MockFaults) {
        lock(&self.state).faults = faults;
    }

    pub fn set_j1708_supported(&self, supported: bool) {
        lock(&self.state).j1708_supported = supported;
    }

    pub fn push_can_frame(&self, frame: CanFrame) {
        lock(&self.state).rx_can.push_back(frame);
    }

    pub fn push_j1708_frame(&self, frame: J1708Frame) {
        lock(&self.state).rx_j1708.push_back(frame);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| pred(c)).count()
    }

    /// Bitrate from the most recent successful `set_bitrate`.
    pub fn last_bitrate(&self) -> Option<u32> {
        lock(&self.state).bitrate_kbps
    }

    /// Mode from the most recent successful `set_listening_mode`.
    pub fn last_listen_only(&self) -> Option<bool> {
        lock(&self.state).listen_only
    }

    /// Interfaces created and not yet removed.
    pub fn live_interfaces(&self) -> usize {
        lock(&self.state).live_interfaces
    }

    pub fn sent_can_frames(&self) -> Vec<CanFrame> {
        lock(&self.state).tx_can.clone()
    }

    pub fn sent_j1708_frames(&self) -> Vec<J1708Frame> {
        lock(&self.state).tx_j1708.clone()
    }

    pub fn pending_can_frames(&self) -> usize {
        lock(&self.state).rx_can.len()
    }
}

impl BusDriver for MockDriver {
    type Interface = MockInterface;

    fn new_interface(&self) -> DriverResult<MockInterface> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::NewInterface);
        if st.faults.new_interface {
            return Err(DriverError::Io("driver service unavailable".into()));
        }
        Ok(MockInterface {
            state: Arc::clone(&self.state),
            created: false,
            filters: Vec::new(),
        })
    }
}

pub struct MockInterface {
    state: Arc<Mutex<MockState>>,
    created: bool,
    filters: Vec<HardwareFilter>,
}

impl DriverInterface for MockInterface {
    type Socket = MockSocket;

    fn set_bitrate(&mut self, kbps: u32) -> DriverResult<()> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::SetBitrate(kbps));
        st.bitrate_calls += 1;
        if st.faults.set_bitrate.hits(st.bitrate_calls) {
            return Err(DriverError::Rejected(format!("bitrate {kbps}")));
        }
        st.bitrate_kbps = Some(kbps);
        Ok(())
    }

    fn set_listening_mode(&mut self, listen_only: bool) -> DriverResult<()> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::SetListeningMode(listen_only));
        st.mode_calls += 1;
        if st.faults.set_listening_mode.hits(st.mode_calls) {
            return Err(DriverError::Rejected(format!("listen_only={listen_only}")));
        }
        st.listen_only = Some(listen_only);
        Ok(())
    }

    fn create(&mut self, listen_only: bool) -> DriverResult<()> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::Create(listen_only));
        if st.faults.create {
            return Err(DriverError::Io("create failed".into()));
        }
        st.live_interfaces += 1;
        self.created = true;
        Ok(())
    }

    fn set_filters(&mut self, filters: &[HardwareFilter]) -> DriverResult<()> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::SetFilters(filters.to_vec()));
        if let Some(idx) = st.faults.filter_at {
            if idx < filters.len() {
                return Err(DriverError::Rejected(format!("filter #{idx}")));
            }
        }
        self.filters = filters.to_vec();
        Ok(())
    }

    fn remove(&mut self) -> DriverResult<()> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::Remove);
        if st.faults.remove {
            return Err(DriverError::Io("remove failed".into()));
        }
        if self.created {
            st.live_interfaces = st.live_interfaces.saturating_sub(1);
            self.created = false;
        }
        Ok(())
    }

    fn create_socket(&mut self) -> DriverResult<Option<MockSocket>> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::CreateSocket);
        if !self.created {
            return Err(DriverError::Io("interface not created".into()));
        }
        match st.faults.socket {
            SocketAlloc::Null => Ok(None),
            SocketAlloc::Error => Err(DriverError::Io("no free endpoints".into())),
            SocketAlloc::Ok => Ok(Some(MockSocket {
                state: Arc::clone(&self.state),
                open: false,
                filters: self.filters.clone(),
            })),
        }
    }

    fn is_j1708_supported(&self) -> DriverResult<bool> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::J1708Probe);
        Ok(st.j1708_supported)
    }

    fn can_info(&mut self) -> DriverResult<CanCounters> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::CanInfo);
        if st.faults.info {
            return Err(DriverError::Io("info query failed".into()));
        }
        Ok(CanCounters {
            tx_count: st.tx_can.len() as u32,
            rx_count: st.rx_delivered,
            baud_rate: st.bitrate_kbps.unwrap_or(0).saturating_mul(1000),
            free_tx_buffers: 16,
            free_rx_buffers: 16,
            ..Default::default()
        })
    }

    fn j1708_info(&mut self) -> DriverResult<J1708Counters> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::J1708Info);
        if st.faults.info {
            return Err(DriverError::Io("info query failed".into()));
        }
        if !st.j1708_supported {
            return Err(DriverError::Unsupported("J1708 not fitted"));
        }
        Ok(J1708Counters {
            free_tx_buffers: 8,
            free_rx_buffers: 8,
            ..Default::default()
        })
    }
}

pub struct MockSocket {
    state: Arc<Mutex<MockState>>,
    open: bool,
    filters: Vec<HardwareFilter>,
}

impl MockSocket {
    fn accepts(&self, id: CanId) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(id))
    }
}

impl DriverSocket for MockSocket {
    fn open(&mut self) -> DriverResult<()> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::Open);
        if st.faults.open {
            return Err(DriverError::Io("open failed".into()));
        }
        self.open = true;
        Ok(())
    }

    fn discard_in_buffer(&mut self) -> DriverResult<()> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::DiscardInBuffer);
        if st.faults.discard {
            return Err(DriverError::Io("discard failed".into()));
        }
        st.rx_can.clear();
        st.rx_j1708.clear();
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        let mut st = lock(&self.state);
        st.calls.push(DriverCall::Close);
        self.open = false;
        if st.faults.close {
            return Err(DriverError::Io("close failed".into()));
        }
        Ok(())
    }

    fn read(&mut self, _timeout_ms: Option<u64>) -> DriverResult<CanFrame> {
        if !self.open {
            return Err(DriverError::Io("socket closed".into()));
        }
        let mut st = lock(&self.state);
        while let Some(mut frame) = st.rx_can.pop_front() {
            if self.accepts(frame.id) {
                frame.timestamp.get_or_insert_with(Timestamp::now);
                st.rx_delivered += 1;
                return Ok(frame);
            }
        }
        // Idle heartbeat so read loops stay testable
        let id = st.heartbeat.ok_or(DriverError::Timeout)?;
        let mut frame =
            CanFrame::new(id, &[0x00, 0x00, 0x00, 0x00]).ok_or(DriverError::InvalidFrame("len"))?;
        frame.timestamp = Some(Timestamp::now());
        st.rx_delivered += 1;
        Ok(frame)
    }

    fn write(&mut self, frame: &CanFrame) -> DriverResult<()> {
        if !self.open {
            return Err(DriverError::Io("socket closed".into()));
        }
        lock(&self.state).tx_can.push(frame.clone());
        Ok(())
    }

    fn read_j1708(&mut self, _timeout_ms: Option<u64>) -> DriverResult<J1708Frame> {
        let mut st = lock(&self.state);
        if !st.j1708_supported {
            return Err(DriverError::Unsupported("J1708 not fitted"));
        }
        st.rx_j1708.pop_front().ok_or(DriverError::Timeout)
    }

    fn write_j1708(&mut self, frame: &J1708Frame) -> DriverResult<()> {
        let mut st = lock(&self.state);
        if !st.j1708_supported {
            return Err(DriverError::Unsupported("J1708 not fitted"));
        }
        st.tx_j1708.push(frame.clone());
        Ok(())
    }
}
