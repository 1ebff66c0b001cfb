use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Process-wide counters/gauges/histogram for the proxy, exposed in
/// Prometheus text exposition format at `/metrics`.
///
/// Unlike the teacher's `EventHub`, which fans a cloned event out to
/// arbitrary sinks via `tokio::spawn`, metrics recording here is a direct,
/// synchronous, in-process update -- there is nothing to await and nothing
/// that can fail, so the fire-and-forget shape the teacher needs for
/// sinks with I/O (our `UsageSink`, see usage.rs) isn't needed here.
pub struct MetricsSink {
    registry: Registry,
    requests_total: IntCounterVec,
    upstream_retries_total: IntCounterVec,
    queue_overflow_total: IntCounterVec,
    usage_tokens_total: IntCounterVec,
    scheduler_running: IntGaugeVec,
    scheduler_queued: IntGaugeVec,
    scheduler_reservoir: IntGaugeVec,
    scheduler_active_users: IntGauge,
    request_duration_seconds: HistogramVec,
}

impl MetricsSink {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Total proxied requests"),
            &["endpoint", "status"],
        )?;
        let upstream_retries_total = IntCounterVec::new(
            Opts::new("upstream_retries_total", "Total upstream retry attempts"),
            &["reason"],
        )?;
        let queue_overflow_total = IntCounterVec::new(
            Opts::new("queue_overflow_total", "Scheduler queue overflow rejections"),
            &["limiter"],
        )?;
        let usage_tokens_total = IntCounterVec::new(
            Opts::new("usage_tokens_total", "Tokens recorded from upstream usage"),
            &["kind"],
        )?;
        let scheduler_running = IntGaugeVec::new(
            Opts::new("scheduler_running", "In-flight jobs per limiter"),
            &["limiter"],
        )?;
        let scheduler_queued = IntGaugeVec::new(
            Opts::new("scheduler_queued", "Queued waiters per limiter"),
            &["limiter"],
        )?;
        let scheduler_reservoir = IntGaugeVec::new(
            Opts::new("scheduler_reservoir", "Remaining reservoir per limiter"),
            &["limiter"],
        )?;
        let scheduler_active_users =
            IntGauge::new("scheduler_active_users", "Number of per-user limiters alive")?;
        let request_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "Request handling latency in seconds",
            ),
            &["endpoint"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(upstream_retries_total.clone()))?;
        registry.register(Box::new(queue_overflow_total.clone()))?;
        registry.register(Box::new(usage_tokens_total.clone()))?;
        registry.register(Box::new(scheduler_running.clone()))?;
        registry.register(Box::new(scheduler_queued.clone()))?;
        registry.register(Box::new(scheduler_reservoir.clone()))?;
        registry.register(Box::new(scheduler_active_users.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            upstream_retries_total,
            queue_overflow_total,
            usage_tokens_total,
            scheduler_running,
            scheduler_queued,
            scheduler_reservoir,
            scheduler_active_users,
            request_duration_seconds,
        })
    }

    pub fn record_request(&self, endpoint: &str, status: u16, elapsed: std::time::Duration) {
        self.requests_total
            .with_label_values(&[endpoint, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_retry(&self, reason: &str) {
        self.upstream_retries_total.with_label_values(&[reason]).inc();
    }

    pub fn record_queue_overflow(&self, limiter: &str) {
        self.queue_overflow_total.with_label_values(&[limiter]).inc();
    }

    pub fn record_tokens(&self, kind: &str, count: u64) {
        self.usage_tokens_total.with_label_values(&[kind]).inc_by(count);
    }

    pub fn set_limiter_state(&self, limiter: &str, running: i64, queued: i64, reservoir: i64) {
        self.scheduler_running.with_label_values(&[limiter]).set(running);
        self.scheduler_queued.with_label_values(&[limiter]).set(queued);
        self.scheduler_reservoir
            .with_label_values(&[limiter])
            .set(reservoir);
    }

    pub fn set_active_users(&self, count: i64) {
        self.scheduler_active_users.set(count);
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        // Encoding into an in-memory buffer cannot fail for well-formed
        // metric families produced by this registry.
        let _ = encoder.encode(&metric_families, &mut buffer);
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_series() {
        let sink = MetricsSink::new().unwrap();
        sink.record_request("/v1/chat/completions", 200, std::time::Duration::from_millis(5));
        sink.record_queue_overflow("global");
        let rendered = sink.render();
        assert!(rendered.contains("requests_total"));
        assert!(rendered.contains("queue_overflow_total"));
    }
}
