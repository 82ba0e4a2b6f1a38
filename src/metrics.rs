use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Prometheus registry for the crawl loops. Recording happens in the worker
/// and master; rendering is on demand (the `stats` command), there is no
/// exposition endpoint in-process.
pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub requests_duration: HistogramVec,
    pub requests_in_progress: IntGaugeVec,
    pub tasks_total: IntCounterVec,
    pub tasks_duration: HistogramVec,
    pub queue_size: IntGauge,
    pub workers_total: IntGauge,
    pub memory_usage: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("crawler_requests_total", "Total number of requests"),
            &["method", "status", "domain"],
        )?;
        let requests_duration = HistogramVec::new(
            HistogramOpts::new(
                "crawler_requests_duration_seconds",
                "Request duration in seconds",
            ),
            &["domain"],
        )?;
        let requests_in_progress = IntGaugeVec::new(
            Opts::new(
                "crawler_requests_in_progress",
                "Number of requests in progress",
            ),
            &["domain"],
        )?;
        let tasks_total = IntCounterVec::new(
            Opts::new("crawler_tasks_total", "Total number of tasks processed"),
            &["status", "worker"],
        )?;
        let tasks_duration = HistogramVec::new(
            HistogramOpts::new(
                "crawler_tasks_duration_seconds",
                "Task processing duration in seconds",
            ),
            &["worker"],
        )?;
        let queue_size = IntGauge::new("crawler_queue_size", "Number of items in the queue")?;
        let workers_total = IntGauge::new("crawler_workers_total", "Total number of workers")?;
        let memory_usage = IntGauge::new("crawler_memory_usage_bytes", "Memory usage in bytes")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_duration.clone()))?;
        registry.register(Box::new(requests_in_progress.clone()))?;
        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(tasks_duration.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;
        registry.register(Box::new(workers_total.clone()))?;
        registry.register(Box::new(memory_usage.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_duration,
            requests_in_progress,
            tasks_total,
            tasks_duration,
            queue_size,
            workers_total,
            memory_usage,
        })
    }

    pub fn record_request(&self, method: &str, status: &str, domain: &str, duration: f64) {
        self.requests_total
            .with_label_values(&[method, status, domain])
            .inc();
        self.requests_duration
            .with_label_values(&[domain])
            .observe(duration);
    }

    pub fn record_task(&self, status: &str, worker: &str, duration: f64) {
        self.tasks_total.with_label_values(&[status, worker]).inc();
        self.tasks_duration
            .with_label_values(&[worker])
            .observe(duration);
    }

    /// Resident set size from procfs, if available.
    pub fn update_memory_usage(&self) {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<i64>().ok())
            {
                self.memory_usage.set(resident_pages * 4096);
            }
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record_and_render() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("GET", "200", "a.test", 0.12);
        metrics.record_task("success", "worker-1", 0.5);
        metrics.queue_size.set(42);

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("crawler_requests_total"));
        assert!(rendered.contains("crawler_queue_size 42"));
        assert!(rendered.contains("worker-1"));
    }
}
