use std::sync::atomic::{AtomicU64, Ordering};

/// Process counters exposed on `/metrics`.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    rate_limited: AtomicU64,
    locked_out: AtomicU64,
    csrf_rejected: AtomicU64,
}

impl Metrics {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_locked_out(&self) {
        self.locked_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_csrf_rejected(&self) {
        self.csrf_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        format!(
            "haven_up 1\n\
             haven_http_requests_total {}\n\
             haven_http_rate_limited_total {}\n\
             haven_auth_locked_out_total {}\n\
             haven_csrf_rejected_total {}\n",
            self.requests.load(Ordering::Relaxed),
            self.rate_limited.load(Ordering::Relaxed),
            self.locked_out.load(Ordering::Relaxed),
            self.csrf_rejected.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters() {
        let metrics = Metrics::default();
        metrics.record_request();
        metrics.record_request();
        metrics.record_csrf_rejected();
        let text = metrics.render();
        assert!(text.contains("haven_http_requests_total 2\n"));
        assert!(text.contains("haven_csrf_rejected_total 1\n"));
        assert!(text.contains("haven_http_rate_limited_total 0\n"));
    }
}
