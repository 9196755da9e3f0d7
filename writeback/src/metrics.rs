use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

pub(crate) struct Metrics {
    pub reads: Counter,
    pub reads_skipped: Counter,
    pub writes: Counter,
    pub writes_journaled: Counter,
    pub writes_completed: Counter,
    pub writes_failed: Counter,
    pub journal_extents: Counter,
    pub tracked_objects: Gauge,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics in the provided registry.
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            reads: Counter::default(),
            reads_skipped: Counter::default(),
            writes: Counter::default(),
            writes_journaled: Counter::default(),
            writes_completed: Counter::default(),
            writes_failed: Counter::default(),
            journal_extents: Counter::default(),
            tracked_objects: Gauge::default(),
        };

        registry.register(
            "reads",
            "Number of object reads submitted",
            metrics.reads.clone(),
        );
        registry.register(
            "reads_skipped",
            "Number of object reads answered without contacting the store",
            metrics.reads_skipped.clone(),
        );
        registry.register(
            "writes",
            "Number of object writes submitted",
            metrics.writes.clone(),
        );
        registry.register(
            "writes_journaled",
            "Number of object writes gated on a journal event",
            metrics.writes_journaled.clone(),
        );
        registry.register(
            "writes_completed",
            "Number of object writes delivered to the caller",
            metrics.writes_completed.clone(),
        );
        registry.register(
            "writes_failed",
            "Number of object writes delivered with an error",
            metrics.writes_failed.clone(),
        );
        registry.register(
            "journal_extents",
            "Number of extents recorded as committed in the journal",
            metrics.journal_extents.clone(),
        );
        registry.register(
            "tracked_objects",
            "Number of objects with writes awaiting delivery",
            metrics.tracked_objects.clone(),
        );

        metrics
    }
}
