//! Prometheus metrics for pipeline worker observability.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct HandoffTypeLabel(pub String);

impl prometheus_client::encoding::EncodeLabelSet for HandoffTypeLabel {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("type", self.0.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClusterOutcomeLabel(pub String);

impl prometheus_client::encoding::EncodeLabelSet for ClusterOutcomeLabel {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("outcome", self.0.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct WorkerMetrics {
    pub active_branches: Gauge,
    pub handoffs_recorded: Family<HandoffTypeLabel, Counter>,
    pub cluster_outcomes: Family<ClusterOutcomeLabel, Counter>,
    pub describe_retries_total: Counter,
    pub describe_failures_total: Counter,
    pub recursion_cap_hits_total: Counter,
    registry: Arc<Registry>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let active_branches = Gauge::default();
        registry.register(
            "kg_worker_active_branches",
            "Number of scatter branches currently running",
            active_branches.clone(),
        );

        let handoffs_recorded = Family::<HandoffTypeLabel, Counter>::default();
        registry.register(
            "kg_worker_handoffs_recorded_total",
            "Handoffs recorded by type",
            handoffs_recorded.clone(),
        );

        let cluster_outcomes = Family::<ClusterOutcomeLabel, Counter>::default();
        registry.register(
            "kg_worker_cluster_outcomes_total",
            "Cluster worker terminal outcomes by kind (joined, dissolved, terminated)",
            cluster_outcomes.clone(),
        );

        let describe_retries_total = Counter::default();
        registry.register(
            "kg_worker_describe_retries_total",
            "Malformed-JSON retries consumed by the describe worker",
            describe_retries_total.clone(),
        );

        let describe_failures_total = Counter::default();
        registry.register(
            "kg_worker_describe_failures_total",
            "Describe calls that exhausted their retry budget",
            describe_failures_total.clone(),
        );

        let recursion_cap_hits_total = Counter::default();
        registry.register(
            "kg_worker_recursion_cap_hits_total",
            "Branches halted by the recursion safety cap",
            recursion_cap_hits_total.clone(),
        );

        Self {
            active_branches,
            handoffs_recorded,
            cluster_outcomes,
            describe_retries_total,
            describe_failures_total,
            recursion_cap_hits_total,
            registry: Arc::new(registry),
        }
    }

    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).unwrap();
        buf
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
