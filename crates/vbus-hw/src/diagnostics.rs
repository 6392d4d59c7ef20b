//! Best-effort hardware counter snapshots.
//!
//! Nothing here mutates interface or socket state, and every failure is logged and
//! folded into an absent section of the snapshot instead of being returned.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::lifecycle::InterfaceHandle;
use crate::{BusDriver, DriverInterface};

/// CAN controller counters as reported by the bridge firmware.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CanCounters {
    pub tx_count: u32,
    pub rx_count: u32,
    pub stuff_errors: u32,
    pub form_errors: u32,
    pub ack_errors: u32,
    pub bit1_errors: u32,
    pub bit0_errors: u32,
    pub crc_errors: u32,
    pub lost_messages: u32,
    pub rx_queue_overflowed: bool,
    pub rx_queue_overflow_count: u32,
    pub transmit_confirm: bool,
    pub bus_off_notify: bool,
    pub auto_restart: bool,
    pub auto_recovery_attempts: u32,
    pub rx_wait_for_host: u32,
    pub rx_bad_values: u32,
    pub bus_off_interrupts: u32,
    pub bus_off_notifies: u32,
    pub bus_off_want_notify_host: u32,
    pub bus_errors: u32,
    pub dropped_from_host: u32,
    pub bus_transition_detected: bool,
    pub current_bus_state: u32,
    pub free_tx_buffers: u32,
    pub free_rx_buffers: u32,
    pub baud_rate: u32,
    pub test_mode: bool,
    pub hardware_errors: u32,
    pub overflow_reported: bool,
}

impl CanCounters {
    /// Flattened `(name, value)` view; flags map to 0/1.
    pub fn fields(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("tx_count", u64::from(self.tx_count)),
            ("rx_count", u64::from(self.rx_count)),
            ("stuff_errors", u64::from(self.stuff_errors)),
            ("form_errors", u64::from(self.form_errors)),
            ("ack_errors", u64::from(self.ack_errors)),
            ("bit1_errors", u64::from(self.bit1_errors)),
            ("bit0_errors", u64::from(self.bit0_errors)),
            ("crc_errors", u64::from(self.crc_errors)),
            ("lost_messages", u64::from(self.lost_messages)),
            ("rx_queue_overflowed", u64::from(self.rx_queue_overflowed)),
            ("rx_queue_overflow_count", u64::from(self.rx_queue_overflow_count)),
            ("transmit_confirm", u64::from(self.transmit_confirm)),
            ("bus_off_notify", u64::from(self.bus_off_notify)),
            ("auto_restart", u64::from(self.auto_restart)),
            ("auto_recovery_attempts", u64::from(self.auto_recovery_attempts)),
            ("rx_wait_for_host", u64::from(self.rx_wait_for_host)),
            ("rx_bad_values", u64::from(self.rx_bad_values)),
            ("bus_off_interrupts", u64::from(self.bus_off_interrupts)),
            ("bus_off_notifies", u64::from(self.bus_off_notifies)),
            ("bus_off_want_notify_host", u64::from(self.bus_off_want_notify_host)),
            ("bus_errors", u64::from(self.bus_errors)),
            ("dropped_from_host", u64::from(self.dropped_from_host)),
            ("bus_transition_detected", u64::from(self.bus_transition_detected)),
            ("current_bus_state", u64::from(self.current_bus_state)),
            ("free_tx_buffers", u64::from(self.free_tx_buffers)),
            ("free_rx_buffers", u64::from(self.free_rx_buffers)),
            ("baud_rate", u64::from(self.baud_rate)),
            ("test_mode", u64::from(self.test_mode)),
            ("hardware_errors", u64::from(self.hardware_errors)),
            ("overflow_reported", u64::from(self.overflow_reported)),
        ]
    }
}

/// J1708 transceiver counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct J1708Counters {
    pub rx_count: u32,
    pub wait_for_busy_bus: u32,
    pub collisions: u32,
    pub dropped_rx: u32,
    pub dropped_tx_confirm: u32,
    pub dropped_from_host: u32,
    pub mid_filter_enabled: bool,
    pub transmit_confirm: bool,
    pub rx_queue_overflowed: bool,
    pub bus_transitions: u32,
    pub current_bus_state: u32,
    pub free_tx_buffers: u32,
    pub free_rx_buffers: u32,
    pub overflow_reported: bool,
}

impl J1708Counters {
    pub fn fields(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("rx_count", u64::from(self.rx_count)),
            ("wait_for_busy_bus", u64::from(self.wait_for_busy_bus)),
            ("collisions", u64::from(self.collisions)),
            ("dropped_rx", u64::from(self.dropped_rx)),
            ("dropped_tx_confirm", u64::from(self.dropped_tx_confirm)),
            ("dropped_from_host", u64::from(self.dropped_from_host)),
            ("mid_filter_enabled", u64::from(self.mid_filter_enabled)),
            ("transmit_confirm", u64::from(self.transmit_confirm)),
            ("rx_queue_overflowed", u64::from(self.rx_queue_overflowed)),
            ("bus_transitions", u64::from(self.bus_transitions)),
            ("current_bus_state", u64::from(self.current_bus_state)),
            ("free_tx_buffers", u64::from(self.free_tx_buffers)),
            ("free_rx_buffers", u64::from(self.free_rx_buffers)),
            ("overflow_reported", u64::from(self.overflow_reported)),
        ]
    }
}

/// Counters for each bus type the hardware answered for. A section is `None` when
/// the bus is unsupported or the query failed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub captured_at_unix: i64,
    pub can: Option<CanCounters>,
    pub j1708: Option<J1708Counters>,
}

impl CounterSnapshot {
    pub fn is_empty(&self) -> bool {
        self.can.is_none() && self.j1708.is_none()
    }
}

/// Read counters through a live interface handle.
pub fn capture<I: DriverInterface>(handle: &mut InterfaceHandle<I>) -> CounterSnapshot {
    match handle.interface_mut() {
        Some(iface) => capture_interface(iface),
        None => {
            warn!("diagnostics requested for a removed interface");
            CounterSnapshot {
                captured_at_unix: OffsetDateTime::now_utc().unix_timestamp(),
                ..Default::default()
            }
        }
    }
}

/// Read counters through a fresh, uncreated driver interface.
pub fn capture_standalone<D: BusDriver>(driver: &D) -> CounterSnapshot {
    match driver.new_interface() {
        Ok(mut iface) => capture_interface(&mut iface),
        Err(e) => {
            warn!("diagnostics: unable to instantiate driver interface: {e}");
            CounterSnapshot {
                captured_at_unix: OffsetDateTime::now_utc().unix_timestamp(),
                ..Default::default()
            }
        }
    }
}

pub(crate) fn capture_interface<I: DriverInterface>(iface: &mut I) -> CounterSnapshot {
    let can = match iface.can_info() {
        Ok(c) => {
            for (name, value) in c.fields() {
                debug!("CAN info: {name}={value}");
            }
            Some(c)
        }
        Err(e) => {
            warn!("unable to get CAN debug info: {e}");
            None
        }
    };
    let j1708 = match iface.is_j1708_supported() {
        Ok(true) => match iface.j1708_info() {
            Ok(j) => {
                for (name, value) in j.fields() {
                    debug!("J1708 info: {name}={value}");
                }
                Some(j)
            }
            Err(e) => {
                warn!("unable to get J1708 debug info: {e}");
                None
            }
        },
        Ok(false) => None,
        Err(e) => {
            warn!("unable to query J1708 support: {e}");
            None
        }
    };
    CounterSnapshot {
        captured_at_unix: OffsetDateTime::now_utc().unix_timestamp(),
        can,
        j1708,
    }
}
