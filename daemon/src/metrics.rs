//! Prometheus metrics

use crate::config::MonitoringConfig;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Metrics struct
#[derive(Clone)]
pub struct Metrics {
    // Counters
    pub provisions_started: IntCounter,
    pub provisions_succeeded: IntCounter,
    pub provisions_failed: IntCounter,
    pub invocations: IntCounterVec,
    pub invocations_unavailable: IntCounter,
    pub invocations_failed: IntCounter,

    // Gauges
    pub ready_runtimes: IntGauge,

    // Histograms
    pub provision_duration: Histogram,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let provisions_started = IntCounter::with_opts(Opts::new(
            "plugind_provisions_started_total",
            "Plugin environments whose provisioning started",
        ))?;

        let provisions_succeeded = IntCounter::with_opts(Opts::new(
            "plugind_provisions_succeeded_total",
            "Plugin environments that became ready",
        ))?;

        let provisions_failed = IntCounter::with_opts(Opts::new(
            "plugind_provisions_failed_total",
            "Plugin environments that failed provisioning or installation",
        ))?;

        let invocations = IntCounterVec::new(
            Opts::new("plugind_invocations_total", "Capability calls by method"),
            &["method"],
        )?;

        let invocations_unavailable = IntCounter::with_opts(Opts::new(
            "plugind_invocations_unavailable_total",
            "Capability calls rejected because the plugin was not ready",
        ))?;

        let invocations_failed = IntCounter::with_opts(Opts::new(
            "plugind_invocations_failed_total",
            "Capability calls that failed against a ready plugin",
        ))?;

        let ready_runtimes = IntGauge::with_opts(Opts::new(
            "plugind_ready_runtimes",
            "Number of ready plugin runtimes",
        ))?;

        let provision_duration = Histogram::with_opts(
            HistogramOpts::new(
                "plugind_provision_duration_seconds",
                "Time from provisioning start to ready or failed",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;

        // Register metrics. Registration fails for any later instance and is
        // ignored, so only the first instance built is exported.
        REGISTRY.register(Box::new(provisions_started.clone())).ok();
        REGISTRY.register(Box::new(provisions_succeeded.clone())).ok();
        REGISTRY.register(Box::new(provisions_failed.clone())).ok();
        REGISTRY.register(Box::new(invocations.clone())).ok();
        REGISTRY.register(Box::new(invocations_unavailable.clone())).ok();
        REGISTRY.register(Box::new(invocations_failed.clone())).ok();
        REGISTRY.register(Box::new(ready_runtimes.clone())).ok();
        REGISTRY.register(Box::new(provision_duration.clone())).ok();

        Ok(Self {
            provisions_started,
            provisions_succeeded,
            provisions_failed,
            invocations,
            invocations_unavailable,
            invocations_failed,
            ready_runtimes,
            provision_duration,
        })
    }
}

fn render() -> Vec<u8> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    buffer
}

/// Start the metrics server
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{Response, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    let mut response = Response::new(Full::new(Bytes::from(render())));
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    Ok::<_, std::convert::Infallible>(response)
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}
