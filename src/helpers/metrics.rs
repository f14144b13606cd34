use prometheus::{
    register_histogram_vec, register_int_counter, HistogramVec, IntCounter,
};

/// prometheus metrics exposed on /metrics
#[derive(Clone)]
pub struct Metrics {
    pub fleet_handled_events: IntCounter,
    pub lifecycle_handled_events: IntCounter,
    pub port_allocations: IntCounter,
    pub fleet_reconcile_duration: HistogramVec,
    pub lifecycle_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let fleet_reconcile_duration = register_histogram_vec!(
            "fleet_reconciler_reconcile_duration_seconds",
            "The duration of proxy fleet reconcile passes in seconds",
            &[],
            vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]
        )
        .unwrap();

        let lifecycle_duration = register_histogram_vec!(
            "lifecycle_operation_duration_seconds",
            "The duration of server lifecycle operations in seconds",
            &["operation"],
            vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]
        )
        .unwrap();

        Metrics {
            fleet_handled_events: register_int_counter!(
                "fleet_reconciler_handled_events",
                "fleet reconciler handled events"
            )
            .unwrap(),
            lifecycle_handled_events: register_int_counter!(
                "lifecycle_handled_events",
                "server lifecycle handled events"
            )
            .unwrap(),
            port_allocations: register_int_counter!(
                "port_arbiter_allocations",
                "successful port allocations"
            )
            .unwrap(),
            fleet_reconcile_duration,
            lifecycle_duration,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
