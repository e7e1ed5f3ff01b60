use crate::Error;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    /// Passes that stopped early because the cluster has not converged yet, by reason
    pub deferrals: IntCounterVec,
    /// Condition flips, by condition type and new status
    pub condition_transitions: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "crc_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            // ssh bootstrap and key generation make for long passes
            .buckets(vec![0.01, 0.1, 0.5, 1., 5., 15., 60., 180.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "crc_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("crc_operator_reconciliations_total", "reconciliations").unwrap();
        let deferrals = IntCounterVec::new(
            opts!(
                "crc_operator_deferrals_total",
                "reconcile passes deferred until the cluster converges",
            ),
            &["instance", "reason"],
        )
        .unwrap();
        let condition_transitions = IntCounterVec::new(
            opts!(
                "crc_operator_condition_transitions_total",
                "CrcCluster condition status changes",
            ),
            &["type", "status"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            deferrals,
            condition_transitions,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.deferrals.clone()))?;
        registry.register(Box::new(self.condition_transitions.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: kube::Resource<DynamicType = ()>>(&self, rc: &T, e: &Error) {
        self.failures
            .with_label_values(&[
                T::kind(&()).as_ref(),
                rc.name_any().as_ref(),
                e.metric_label(),
            ])
            .inc()
    }

    pub fn deferred<T: kube::Resource<DynamicType = ()>>(&self, rc: &T, reason: &str) {
        self.deferrals
            .with_label_values(&[rc.name_any().as_ref(), reason])
            .inc()
    }

    pub fn condition_changed(&self, r#type: &str, status: &str) {
        self.condition_transitions
            .with_label_values(&[r#type, status])
            .inc()
    }

    pub fn count_and_measure<T: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<T> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: std::marker::PhantomData,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer<T: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: std::marker::PhantomData<T>,
}

impl<T: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<T> {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[T::kind(&()).as_ref()])
            .observe(duration);
    }
}
