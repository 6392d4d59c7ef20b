//! Ordered bring-up and tear-down of one physical bus interface.
//!
//! The driver needs bitrate and listen mode applied both before and after
//! `create`: a bitrate set before the first create after power-up does not take
//! effect, and creating listen-only keeps the transceiver off the bus while the
//! bitrate is still unconfirmed.
//!
//! An interface the driver refused to remove is kept by the lifecycle as
//! stranded. Removal is retried before the next bring-up, so the driver never
//! sees a second `create` while it may still hold the first.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::diagnostics::{self, CounterSnapshot};
use crate::{
    describe_filters, BusDriver, BusError, BusKind, ConfigStep, DriverError, DriverInterface,
    HardwareFilter, Result,
};

/// Ownership state of the single physical interface a lifecycle manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Absent,
    Configuring,
    Live { generation: u64 },
    /// Removal failed; the driver may still hold the interface.
    Stranded,
}

/// Parameters a handle was brought up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub kind: BusKind,
    pub generation: u64,
    pub bitrate_kbps: u32,
    pub listen_only: bool,
}

/// Shared between a live handle and its lifecycle. A handle dropped without
/// teardown parks an interface it could not remove here.
struct Lease<I> {
    returned: Mutex<Option<(I, DriverError)>>,
}

impl<I> Lease<I> {
    fn new() -> Self {
        Self {
            returned: Mutex::new(None),
        }
    }

    fn returned(&self) -> std::sync::MutexGuard<'_, Option<(I, DriverError)>> {
        self.returned.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fully configured interface. It exists only after every bring-up step has
/// succeeded and becomes inert once passed to [`InterfaceLifecycle::teardown`].
///
/// Dropping a live handle removes the interface best-effort; the lifecycle
/// notices on its next call and frees the slot.
#[must_use = "an interface handle must be passed to teardown"]
pub struct InterfaceHandle<I: DriverInterface> {
    iface: Option<I>,
    info: InterfaceInfo,
    filters: Vec<HardwareFilter>,
    lease: Arc<Lease<I>>,
}

impl<I: DriverInterface> InterfaceHandle<I> {
    pub fn info(&self) -> InterfaceInfo {
        self.info
    }

    pub fn kind(&self) -> BusKind {
        self.info.kind
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.info.bitrate_kbps
    }

    pub fn listen_only(&self) -> bool {
        self.info.listen_only
    }

    pub fn filters(&self) -> &[HardwareFilter] {
        &self.filters
    }

    /// False once the handle has been torn down.
    pub fn is_live(&self) -> bool {
        self.iface.is_some()
    }

    pub(crate) fn interface_mut(&mut self) -> Option<&mut I> {
        self.iface.as_mut()
    }
}

impl<I: DriverInterface> Drop for InterfaceHandle<I> {
    fn drop(&mut self) {
        let Some(mut iface) = self.iface.take() else {
            return;
        };
        warn!("{} interface handle dropped without teardown", self.info.kind);
        if let Err(e) = iface.remove() {
            error!("Unable to remove dropped {} interface: {e}", self.info.kind);
            *self.lease.returned() = Some((iface, e));
        }
    }
}

impl<I: DriverInterface> core::fmt::Debug for InterfaceHandle<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InterfaceHandle")
            .field("info", &self.info)
            .field("filters", &self.filters)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Brings one bus interface up and down against a driver.
///
/// No internal locking: callers serialize bring-up, teardown and socket calls
/// for a given bus, e.g. by owning the lifecycle from a single service loop.
pub struct InterfaceLifecycle<D: BusDriver> {
    driver: D,
    kind: BusKind,
    slot: SlotState,
    next_generation: u64,
    collect_diagnostics: bool,
    last_snapshot: Option<CounterSnapshot>,
    last_removal_error: Option<BusError>,
    removal_failures: u64,
    lease: Option<Arc<Lease<D::Interface>>>,
    stranded: Option<D::Interface>,
}

impl<D: BusDriver> InterfaceLifecycle<D> {
    pub fn new(driver: D, kind: BusKind) -> Self {
        Self {
            driver,
            kind,
            slot: SlotState::Absent,
            next_generation: 1,
            collect_diagnostics: true,
            last_snapshot: None,
            last_removal_error: None,
            removal_failures: 0,
            lease: None,
            stranded: None,
        }
    }

    /// Whether a counter snapshot is taken after each successful bring-up.
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.collect_diagnostics = enabled;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn kind(&self) -> BusKind {
        self.kind
    }

    /// Current slot state, accounting for a live handle that has since been dropped.
    pub fn slot(&self) -> SlotState {
        match (&self.slot, &self.lease) {
            (SlotState::Live { .. }, Some(lease)) if Arc::strong_count(lease) == 1 => {
                if lease.returned().is_some() {
                    SlotState::Stranded
                } else {
                    SlotState::Absent
                }
            }
            _ => self.slot,
        }
    }

    pub fn last_snapshot(&self) -> Option<&CounterSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// The most recent [`BusError::RemovalFailed`], from teardown, a dropped
    /// handle or cleanup after a failed bring-up.
    pub fn last_removal_error(&self) -> Option<&BusError> {
        self.last_removal_error.as_ref()
    }

    pub fn removal_failures(&self) -> u64 {
        self.removal_failures
    }

    /// Configure and create the interface. Any failing step aborts the sequence;
    /// anything already created on the hardware is removed before returning.
    ///
    /// A stranded interface is removed first; if that still fails the call
    /// returns [`BusError::RemovalFailed`] without touching the driver further.
    pub fn bring_up(
        &mut self,
        listen_only: bool,
        bitrate_kbps: u32,
        filters: Option<&[HardwareFilter]>,
    ) -> Result<InterfaceHandle<D::Interface>> {
        self.reclaim_dropped();
        if let SlotState::Live { .. } = self.slot {
            error!("{} bring-up requested while an interface is live", self.kind);
            return Err(BusError::SlotBusy(self.kind));
        }
        self.remove_stranded()?;
        self.slot = SlotState::Configuring;

        let mut iface = match self.configure(listen_only, bitrate_kbps, filters) {
            Ok(iface) => iface,
            Err(e) => {
                self.slot = if self.stranded.is_some() {
                    SlotState::Stranded
                } else {
                    SlotState::Absent
                };
                return Err(e);
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        self.slot = SlotState::Live { generation };

        if self.collect_diagnostics {
            self.last_snapshot = Some(diagnostics::capture_interface(&mut iface));
        }

        info!(
            "{} interface up @ {}kb {}",
            self.kind,
            bitrate_kbps,
            mode_str(listen_only)
        );
        let lease = Arc::new(Lease::new());
        self.lease = Some(Arc::clone(&lease));
        Ok(InterfaceHandle {
            iface: Some(iface),
            info: InterfaceInfo {
                kind: self.kind,
                generation,
                bitrate_kbps,
                listen_only,
            },
            filters: filters.map(<[HardwareFilter]>::to_vec).unwrap_or_default(),
            lease,
        })
    }

    fn configure(
        &mut self,
        listen_only: bool,
        bitrate_kbps: u32,
        filters: Option<&[HardwareFilter]>,
    ) -> Result<D::Interface> {
        let mut iface = self.driver.new_interface().map_err(|e| {
            error!("Unable to instantiate driver interface: {e}");
            BusError::DriverUnavailable(e)
        })?;

        iface
            .set_bitrate(bitrate_kbps)
            .map_err(|e| rejected(ConfigStep::Bitrate, e))?;

        // Must be listen-only before creating as listen-only
        iface
            .set_listening_mode(listen_only)
            .map_err(|e| rejected(ConfigStep::ListenMode, e))?;

        iface.create(listen_only).map_err(|e| {
            error!("Unable to create interface (listen_only={listen_only}): {e}");
            BusError::CreateFailed {
                listen_only,
                source: e,
            }
        })?;

        if let Err(e) = iface.set_listening_mode(listen_only) {
            return Err(self.abort_created(iface, rejected(ConfigStep::ReapplyListenMode, e)));
        }

        // Bitrate set before the first create after power-up is ignored
        if let Err(e) = iface.set_bitrate(bitrate_kbps) {
            return Err(self.abort_created(iface, rejected(ConfigStep::ReapplyBitrate, e)));
        }

        debug!(
            "Interface created @ {bitrate_kbps}kb {}",
            mode_str(listen_only)
        );

        if let Some(filters) = filters {
            if let Err(e) = iface.set_filters(filters) {
                error!("Unable to set filters: {e}");
                return Err(self.abort_created(iface, BusError::FilterRejected(e)));
            }
            debug!("Filters = {}", describe_filters(filters));
        }

        Ok(iface)
    }

    /// Best-effort removal after a failed post-create step. An interface the
    /// driver keeps is parked as stranded; `err` is returned either way.
    fn abort_created(&mut self, mut iface: D::Interface, err: BusError) -> BusError {
        if let Err(e) = iface.remove() {
            error!("Unable to remove interface after failed bring-up: {e}");
            self.record_removal_failure(e);
            self.stranded = Some(iface);
        }
        err
    }

    /// Remove the interface from the driver. Never fails: a driver error is
    /// logged and recorded, the interface is kept as stranded for a retry, and
    /// the handle is inert afterwards either way.
    pub fn teardown(&mut self, handle: &mut InterfaceHandle<D::Interface>) {
        let Some(mut iface) = handle.iface.take() else {
            debug!("{} teardown: interface already removed", self.kind);
            return;
        };
        let current = self.slot
            == SlotState::Live {
                generation: handle.info.generation,
            };
        match iface.remove() {
            Ok(()) => {
                debug!("{} interface removed", self.kind);
                if current {
                    self.slot = SlotState::Absent;
                }
            }
            Err(e) => {
                error!("Unable to remove {} interface: {e}", self.kind);
                self.record_removal_failure(e);
                if current {
                    self.stranded = Some(iface);
                    self.slot = SlotState::Stranded;
                }
            }
        }
        if current {
            self.lease = None;
        }
    }

    /// Retry removal of a stranded interface. Ok when nothing is stranded.
    pub fn remove_stranded(&mut self) -> Result<()> {
        self.reclaim_dropped();
        let Some(mut iface) = self.stranded.take() else {
            return Ok(());
        };
        match iface.remove() {
            Ok(()) => {
                info!("stranded {} interface removed", self.kind);
                self.slot = SlotState::Absent;
                Ok(())
            }
            Err(e) => {
                error!("Unable to remove stranded {} interface: {e}", self.kind);
                self.record_removal_failure(e.clone());
                self.stranded = Some(iface);
                self.slot = SlotState::Stranded;
                Err(BusError::RemovalFailed(e))
            }
        }
    }

    /// Free the slot of a live handle that was dropped without teardown,
    /// taking over any interface its drop could not remove.
    fn reclaim_dropped(&mut self) {
        let dropped = matches!(&self.lease, Some(lease) if Arc::strong_count(lease) == 1);
        if !dropped {
            return;
        }
        let Some(lease) = self.lease.take() else {
            return;
        };
        let returned = lease.returned().take();
        match returned {
            Some((iface, e)) => {
                self.record_removal_failure(e);
                self.stranded = Some(iface);
                self.slot = SlotState::Stranded;
            }
            None => {
                debug!("{} handle was dropped; slot released", self.kind);
                self.slot = SlotState::Absent;
            }
        }
    }

    fn record_removal_failure(&mut self, e: DriverError) {
        self.removal_failures += 1;
        self.last_removal_error = Some(BusError::RemovalFailed(e));
    }

    /// Probe the hardware for J1708 support. Independent of any handle.
    pub fn is_j1708_supported(&self) -> bool {
        is_j1708_supported(&self.driver)
    }
}

/// Ask a fresh driver interface whether this unit has a J1708 transceiver.
pub fn is_j1708_supported<D: BusDriver>(driver: &D) -> bool {
    debug!("probing J1708 support");
    let supported = driver
        .new_interface()
        .and_then(|iface| iface.is_j1708_supported());
    match supported {
        Ok(v) => v,
        Err(e) => {
            warn!("J1708 support probe failed: {e}");
            false
        }
    }
}

fn rejected(step: ConfigStep, source: DriverError) -> BusError {
    error!("Unable to {step}: {source}");
    BusError::ConfigurationRejected { step, source }
}

fn mode_str(listen_only: bool) -> &'static str {
    if listen_only {
        "READ-ONLY"
    } else {
        "READ-WRITE"
    }
}
