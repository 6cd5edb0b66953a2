//! Prometheus metrics

use crate::config::MonitoringConfig;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Gateway metrics
pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Metrics struct
pub struct Metrics {
    // Counters
    pub connections_accepted: IntCounter,
    pub auth_successes: IntCounter,
    pub auth_failures: IntCounter,
    pub commands: IntCounterVec,
    pub subprocess_failures: IntCounter,
    pub notifications_sent: IntCounter,

    // Gauges
    pub active_connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let connections_accepted = IntCounter::with_opts(Opts::new(
            "evr_gateway_connections_accepted_total",
            "Total number of accepted WebSocket connections",
        ))
        .unwrap();

        let auth_successes = IntCounter::with_opts(Opts::new(
            "evr_gateway_auth_successes_total",
            "Total successful authentications",
        ))
        .unwrap();

        let auth_failures = IntCounter::with_opts(Opts::new(
            "evr_gateway_auth_failures_total",
            "Total failed authentications",
        ))
        .unwrap();

        let commands = IntCounterVec::new(
            Opts::new("evr_gateway_commands_total", "Total commands received"),
            &["cmd"],
        )
        .unwrap();

        let subprocess_failures = IntCounter::with_opts(Opts::new(
            "evr_gateway_subprocess_failures_total",
            "Total unexpected evr failures",
        ))
        .unwrap();

        let notifications_sent = IntCounter::with_opts(Opts::new(
            "evr_gateway_notifications_sent_total",
            "Total blob-modified notifications sent",
        ))
        .unwrap();

        let active_connections = IntGauge::with_opts(Opts::new(
            "evr_gateway_active_connections",
            "Number of active connections",
        ))
        .unwrap();

        // Register metrics
        REGISTRY.register(Box::new(connections_accepted.clone())).ok();
        REGISTRY.register(Box::new(auth_successes.clone())).ok();
        REGISTRY.register(Box::new(auth_failures.clone())).ok();
        REGISTRY.register(Box::new(commands.clone())).ok();
        REGISTRY.register(Box::new(subprocess_failures.clone())).ok();
        REGISTRY.register(Box::new(notifications_sent.clone())).ok();
        REGISTRY.register(Box::new(active_connections.clone())).ok();

        Self {
            connections_accepted,
            auth_successes,
            auth_failures,
            commands,
            subprocess_failures,
            notifications_sent,
            active_connections,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Current metrics in the Prometheus text format
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
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
        use hyper::{Response, StatusCode, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        // touch the metrics so they are registered before the first scrape
        LazyLock::force(&METRICS);

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
                    let mut response = match render() {
                        Ok(buffer) => Response::new(Full::new(Bytes::from(buffer))),
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            let mut response = Response::new(Full::new(Bytes::new()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                    };
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("text/plain"),
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
