//! Prometheus metrics exposition
//!
//! Metrics emitted by the libraries:
//!
//! - `engine_products_total` (counter): label `outcome`
//! - `engine_jobs_total` (counter): label `status`
//! - `engine_push_items_total` (counter): label `outcome`
//! - `gate_wait_seconds` (histogram): label `service`
//! - `key_pool_exhausted_total` (counter): label `key`
//! - `key_pool_resets_total` (counter)

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Gate waits range from nothing to several minutes behind a busy store.
const GATE_WAIT_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full("gate_wait_seconds".to_string()), GATE_WAIT_BUCKETS)
}

/// Install the global Prometheus recorder.
///
/// With `listen_addr` set, an HTTP listener serving the text exposition
/// format runs on the current tokio runtime and no handle is returned.
/// Without one, the handle lets the caller render a summary itself.
pub fn install_recorder(
    listen_addr: Option<SocketAddr>,
) -> Result<Option<PrometheusHandle>, BuildError> {
    match listen_addr {
        Some(addr) => {
            builder()?.with_http_listener(addr).install()?;
            Ok(None)
        }
        None => builder()?.install_recorder().map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_wait_renders_as_histogram() {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::histogram!("gate_wait_seconds", "service" => "store").record(0.7);

        let output = handle.render();
        assert!(
            output.contains("gate_wait_seconds_bucket"),
            "gate waits must render _bucket lines, got: {output}"
        );
        assert!(output.contains("service=\"store\""));
    }
}
