//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Each binary owns its registry
//! and controls which metrics it reports; the receiver and the gateway
//! simulator share the same set so dashboards line up.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9200`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// Cloning is cheap (handles are reference counted), so the reader
/// thread and the sentence aggregator each hold their own copy.
#[derive(Clone, Debug)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Ingress counters
    pub rtp_packets_received_total: IntCounter,
    pub rtcp_packets_received_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub unknown_ssrc_packets_total: IntCounter,

    // Per-packet failures (packet dropped, loop continues)
    pub decrypt_failures_total: IntCounter,
    pub malformed_packets_total: IntCounter,
    pub decode_failures_total: IntCounter,

    // Jitter buffer
    pub jitter_stale_packets_total: IntCounter,
    pub frames_concealed_total: IntCounter,
    pub jitter_buffer_occupancy_packets: IntGauge,

    // Utterance segmentation
    pub utterances_flushed_total: IntCounter,

    // Egress counters (gateway simulator)
    pub packets_sent_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub rtcp_reports_sent_total: IntCounter,

    // Latency histograms (seconds)
    pub encode_seconds: Histogram,
    pub decode_seconds: Histogram,
    pub utterance_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("voice_capture".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let rtp_packets_received_total =
            counter("rtp_packets_received_total", "Total RTP packets received")?;
        let rtcp_packets_received_total =
            counter("rtcp_packets_received_total", "Total RTCP packets received")?;
        let bytes_received_total =
            counter("udp_bytes_received_total", "Total UDP bytes received")?;
        let unknown_ssrc_packets_total = counter(
            "unknown_ssrc_packets_total",
            "RTP packets whose SSRC had no speaker mapping",
        )?;
        let decrypt_failures_total = counter(
            "decrypt_failures_total",
            "Packets dropped because decryption failed",
        )?;
        let malformed_packets_total = counter(
            "malformed_packets_total",
            "Packets dropped because the header could not be parsed",
        )?;
        let decode_failures_total = counter(
            "opus_decode_failures_total",
            "Opus frames replaced with silence after a decode error",
        )?;
        let jitter_stale_packets_total = counter(
            "jitter_stale_packets_total",
            "Packets at or behind the last emitted sequence number",
        )?;
        let frames_concealed_total = counter(
            "frames_concealed_total",
            "Missing frames filled by FEC or silence",
        )?;
        let utterances_flushed_total = counter(
            "utterances_flushed_total",
            "Speaker utterances segmented on silence and delivered",
        )?;
        let packets_sent_total = counter("rtp_packets_sent_total", "Total RTP packets sent")?;
        let bytes_sent_total = counter("udp_bytes_sent_total", "Total UDP bytes sent")?;
        let rtcp_reports_sent_total =
            counter("rtcp_reports_sent_total", "Total RTCP receiver reports sent")?;

        let jitter_buffer_occupancy_packets = IntGauge::with_opts(Opts::new(
            "jitter_buffer_occupancy_packets",
            "Current jitter buffer occupancy in packets",
        ))?;
        registry.register(Box::new(jitter_buffer_occupancy_packets.clone()))?;

        let histogram = |name: &str, help: &str| -> Result<Histogram> {
            let h = Histogram::with_opts(HistogramOpts::new(name, help))?;
            registry.register(Box::new(h.clone()))?;
            Ok(h)
        };

        let encode_seconds = histogram("opus_encode_seconds", "Opus encode duration in seconds")?;
        let decode_seconds = histogram("opus_decode_seconds", "Opus decode duration in seconds")?;
        let utterance_seconds = histogram(
            "utterance_audio_seconds",
            "Audio duration of each delivered utterance (seconds)",
        )?;

        Ok(Self {
            registry,
            rtp_packets_received_total,
            rtcp_packets_received_total,
            bytes_received_total,
            unknown_ssrc_packets_total,
            decrypt_failures_total,
            malformed_packets_total,
            decode_failures_total,
            jitter_stale_packets_total,
            frames_concealed_total,
            jitter_buffer_occupancy_packets,
            utterances_flushed_total,
            packets_sent_total,
            bytes_sent_total,
            rtcp_reports_sent_total,
            encode_seconds,
            decode_seconds,
            utterance_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::try_bind(&cfg.bind)
                .map_err(|e| anyhow::anyhow!("failed to bind metrics server on {}: {e}", cfg.bind))?
                .serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}
