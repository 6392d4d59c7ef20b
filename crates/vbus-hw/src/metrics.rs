use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::diagnostics::CounterSnapshot;
use crate::BusError;

#[derive(Clone)]
pub struct BusMetrics {
    pub bring_ups: IntCounter,
    pub bring_up_failures: IntCounterVec,
    pub can_counters: IntGaugeVec,
    pub j1708_counters: IntGaugeVec,
}

/// Prometheus registry holding bring-up outcomes and the latest hardware counters.
#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub bus: BusMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let err = |e: prometheus::Error| format!("metrics init error: {e}");
        let registry = Registry::new();
        let bring_ups = IntCounter::new("vbs_bring_up_attempts", "Interface bring-up attempts")
            .map_err(err)?;
        let bring_up_failures = IntCounterVec::new(
            Opts::new("vbs_bring_up_failures", "Failed bring-ups by error kind"),
            &["kind"],
        )
        .map_err(err)?;
        let can_counters = IntGaugeVec::new(
            Opts::new("vbs_can_counter", "Latest CAN controller counters"),
            &["counter"],
        )
        .map_err(err)?;
        let j1708_counters = IntGaugeVec::new(
            Opts::new("vbs_j1708_counter", "Latest J1708 transceiver counters"),
            &["counter"],
        )
        .map_err(err)?;
        let bus = BusMetrics {
            bring_ups,
            bring_up_failures,
            can_counters,
            j1708_counters,
        };
        let _ = registry.register(Box::new(bus.bring_ups.clone()));
        let _ = registry.register(Box::new(bus.bring_up_failures.clone()));
        let _ = registry.register(Box::new(bus.can_counters.clone()));
        let _ = registry.register(Box::new(bus.j1708_counters.clone()));
        Ok(Self { registry, bus })
    }

    pub fn record_bring_up<T>(&self, outcome: &Result<T, BusError>) {
        self.bus.bring_ups.inc();
        if let Err(e) = outcome {
            self.bus.bring_up_failures.with_label_values(&[e.kind()]).inc();
        }
    }

    pub fn record_snapshot(&self, snap: &CounterSnapshot) {
        if let Some(can) = &snap.can {
            for (name, value) in can.fields() {
                self.bus
                    .can_counters
                    .with_label_values(&[name])
                    .set(i64::try_from(value).unwrap_or(i64::MAX));
            }
        }
        if let Some(j1708) = &snap.j1708 {
            for (name, value) in j1708.fields() {
                self.bus
                    .j1708_counters
                    .with_label_values(&[name])
                    .set(i64::try_from(value).unwrap_or(i64::MAX));
            }
        }
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CanCounters;

    #[test]
    fn exports_outcomes_and_counters() {
        let hub = MetricsHub::new().unwrap();
        hub.record_bring_up::<()>(&Ok(()));
        hub.record_bring_up::<()>(&Err(BusError::SocketNotOpen));
        hub.record_snapshot(&CounterSnapshot {
            captured_at_unix: 0,
            can: Some(CanCounters {
                rx_count: 42,
                ..Default::default()
            }),
            j1708: None,
        });
        let text = hub.encode_text();
        assert!(text.contains("vbs_bring_up_attempts 2"));
        assert!(text.contains("vbs_bring_up_failures{kind=\"socket_not_open\"} 1"));
        assert!(text.contains("vbs_can_counter{counter=\"rx_count\"} 42"));
    }
}
