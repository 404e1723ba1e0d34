use tracing::trace;

// Trace-based counters. The Prometheus exporter renders whatever recorder is
// installed at startup.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "furnish.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "furnish.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn batch_completed(strategy: &'static str, images: usize, groups: usize, errors: usize) {
    trace!(
        target = "furnish.metrics",
        strategy = strategy,
        images = images as u64,
        groups = groups as u64,
        errors = errors as u64,
        "batch_completed"
    );
}
