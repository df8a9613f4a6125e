// Axum request handler: classifies proxy requests, opens the chosen delivery
// strategy and streams its bytes back as a chunked response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::StreamExt;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::detect::strategy::{classify, DeliveryPlan};
use crate::engine::stats::{MeteredStream, StatsCollector};
use crate::error::ProxyError;
use crate::ingest::StationRecord;
use crate::source::cdn_passthrough::CdnPassthrough;
use crate::source::process_bridge::ProcessBridge;
use crate::source::raw_relay::{RawRelay, RelayTarget};
use crate::source::resolver::{MediaResolver, MediaToolResolver};
use crate::source::traits::{Delivery, DeliveryStrategy, StrategyKind};
use crate::store::StationStore;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared, read-only request context. Nothing here is per-stream.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub resolver: Arc<dyn MediaResolver>,
    pub http: reqwest::Client,
    pub store: Option<Arc<StationStore>>,
    pub stats: Arc<StatsCollector>,
}

impl AppState {
    pub fn new(config: ServerConfig, store: Option<Arc<StationStore>>) -> Self {
        let resolver = Arc::new(MediaToolResolver::new(&config.media_tool));
        Self {
            config: Arc::new(config),
            resolver,
            http: reqwest::Client::new(),
            store,
            stats: Arc::new(StatsCollector::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn MediaResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

pub fn router(state: AppState) -> Router {
    let static_dir = state.config.static_dir.clone();

    let api = Router::new()
        .route("/proxy", get(proxy_handler))
        .route("/stations", get(stations_handler));

    let mut app = Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .route("/stats", get(stats_handler))
        .route("/favicon.ico", get(favicon_handler))
        .with_state(state);

    if let Some(dir) = static_dir {
        info!("serving static assets from {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir));
    }
    app.layer(TraceLayer::new_for_http())
}

pub struct ProxyServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl ProxyServer {
    /// Bind `bind` (use port 0 for a random port) and start serving.
    pub async fn start(state: AppState, bind: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(state);

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("proxy server stopped: {}", e);
            }
        });

        info!("proxy server listening on {}", addr);
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Local proxy URL for a source URL.
    pub fn url_for_source(&self, source_url: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("url", source_url)
            .finish();
        format!("http://127.0.0.1:{}/proxy?{}", self.port(), query)
    }

    /// Stop accepting requests. Open streams get a short grace period.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut self.task).await.is_err() {
            warn!("open streams outlived shutdown grace, aborting");
            self.task.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    url: Option<String>,
}

/// GET /proxy?url=…, streamed through the matching strategy.
async fn proxy_handler(State(state): State<AppState>, Query(query): Query<ProxyQuery>) -> Response {
    let Some(source_url) = query.url.filter(|u| !u.trim().is_empty()) else {
        return ProxyError::Classification("missing url parameter".to_string()).into_response();
    };
    match serve_proxy(&state, &source_url).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

/// Classify, open and assemble. Any error returned here precedes the first
/// streamed byte.
pub async fn serve_proxy(state: &AppState, source_url: &str) -> Result<Response, ProxyError> {
    let plan = classify(source_url)?;
    info!("proxy {} via {}", source_url, plan.label());

    let strategy = build_strategy(&plan, state);
    let delivery = strategy.open().await?;
    Ok(assemble(delivery, strategy.kind(), &state.stats))
}

fn build_strategy(plan: &DeliveryPlan, state: &AppState) -> Box<dyn DeliveryStrategy> {
    let tool = &state.config.media_tool;
    match plan {
        DeliveryPlan::ExternalBridge { source_url } => {
            Box::new(ProcessBridge::for_live_source(source_url, tool))
        }
        DeliveryPlan::CdnPassthrough { source_url } => Box::new(CdnPassthrough::new(
            source_url.clone(),
            Arc::clone(&state.resolver),
            state.http.clone(),
            tool.cdn_chunk_size,
        )),
        DeliveryPlan::RawRelay { host, port, path, use_tls } => Box::new(RawRelay::new(
            RelayTarget {
                host: host.clone(),
                port: *port,
                path: path.clone(),
                use_tls: *use_tls,
            },
            state.config.relay.clone(),
        )),
    }
}

/// Wrap a delivery as a chunked 200 response readable cross-origin.
pub fn assemble(delivery: Delivery, strategy: StrategyKind, stats: &Arc<StatsCollector>) -> Response {
    let body = MeteredStream::new(delivery.body, Arc::clone(stats), strategy)
        .map(Ok::<_, Infallible>);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, delivery.content_type.as_str())
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(body))
        .unwrap_or_else(|e| {
            error!("building {} response failed: {}", strategy.label(), e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Stations with coordinates, straight from the store.
async fn stations_handler(State(state): State<AppState>) -> Response {
    let Some(store) = state.store.clone() else {
        return Json(Vec::<StationRecord>::new()).into_response();
    };
    let limit = state.config.station_limit;
    match tokio::task::spawn_blocking(move || store.query_with_coords(limit)).await {
        Ok(Ok(stations)) => Json(stations).into_response(),
        Ok(Err(e)) => {
            error!("station query failed: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "station store unavailable").into_response()
        }
        Err(e) => {
            error!("station query task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Stream counters.
async fn stats_handler(State(state): State<AppState>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

async fn favicon_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}
