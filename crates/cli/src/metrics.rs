use anyhow::{anyhow, Result};
use arabica_index::IndexStats;
use arabica_protocol::Collection;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Gauges describing the index and the firehose connection.
#[derive(Clone)]
pub struct MetricsExporter {
    registry: Arc<Registry>,
    known_identities: IntGauge,
    indexed_records: IntGauge,
    records_by_collection: IntGaugeVec,
    firehose_connected: IntGauge,
}

impl MetricsExporter {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let known_identities = IntGauge::with_opts(Opts::new(
            "arabica_known_identities",
            "Identities with at least one observed record",
        ))?;
        let indexed_records = IntGauge::with_opts(Opts::new(
            "arabica_indexed_records",
            "Live records in the index",
        ))?;
        let records_by_collection = IntGaugeVec::new(
            Opts::new(
                "arabica_indexed_records_by_collection",
                "Live records in the index per collection",
            ),
            &["collection"],
        )?;
        let firehose_connected = IntGauge::with_opts(Opts::new(
            "arabica_firehose_connected",
            "1 while the firehose consumer is streaming",
        ))?;

        registry.register(Box::new(known_identities.clone()))?;
        registry.register(Box::new(indexed_records.clone()))?;
        registry.register(Box::new(records_by_collection.clone()))?;
        registry.register(Box::new(firehose_connected.clone()))?;

        Ok(Self {
            registry,
            known_identities,
            indexed_records,
            records_by_collection,
            firehose_connected,
        })
    }

    pub fn update(&self, stats: &IndexStats) {
        self.known_identities.set(as_i64(stats.known_identities));
        self.indexed_records.set(as_i64(stats.records));
        for collection in Collection::ALL {
            let count = stats.per_collection.get(&collection).copied().unwrap_or(0);
            self.records_by_collection
                .with_label_values(&[collection.name()])
                .set(as_i64(count));
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.firehose_connected.set(i64::from(connected));
    }

    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve the registry as Prometheus text on every path of `bind`.
    pub fn serve(&self, bind: &str) -> Result<JoinHandle<()>> {
        let addr: SocketAddr = bind.parse()?;
        let exporter = self.clone();
        let make_service = make_service_fn(move |_| {
            let exporter = exporter.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                    let exporter = exporter.clone();
                    async move { Ok::<_, Infallible>(exporter.respond()) }
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .map_err(|err| anyhow!("failed to bind metrics endpoint on {addr}: {err}"))?
            .serve(make_service);
        log::info!("Serving metrics on http://{addr}/metrics");

        Ok(tokio::spawn(async move {
            if let Err(err) = server.await {
                log::error!("Prometheus endpoint failed: {err}");
            }
        }))
    }

    fn respond(&self) -> Response<Body> {
        match self.render() {
            Ok(text) => {
                let mut response = Response::new(Body::from(text));
                if let Ok(value) = TextEncoder::new().format_type().parse() {
                    response
                        .headers_mut()
                        .insert(hyper::header::CONTENT_TYPE, value);
                }
                response
            }
            Err(err) => {
                log::error!("Failed to encode metrics: {err}");
                let mut response = Response::new(Body::from("metrics encoding failed\n"));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
