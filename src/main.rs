use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use image_cache_proxy::{
    cache_manage::CacheManageFilter,
    config::Config,
    disk_cache::DiskImageCache,
    filter::CacheFilter,
    logging::init_logging,
    registry::HttpRegistry,
    serializer::ImageResponseSerializer,
    store::{full_body, ImageBody},
    upstream::HttpUpstream,
    ProxyError,
};
use http_body_util::{combinators::BoxBody, BodyExt};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

fn error_response(status: StatusCode, message: String) -> Response<ImageBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(full_body(message))
        .unwrap_or_else(|_| Response::new(full_body("")))
}

/// Admin routes are answered before the cache filter sees the request;
/// everything else flows through the filter to the upstream.
async fn route(
    request: Request<ImageBody>,
    manage: &CacheManageFilter,
    filter: &CacheFilter,
    upstream: &HttpUpstream,
) -> image_cache_proxy::Result<Response<ImageBody>> {
    if let Some(response) = manage.process_request(&request).await? {
        return Ok(response);
    }
    filter.handle(request, upstream).await
}

async fn serve(
    request: Request<hyper::body::Incoming>,
    manage: Arc<CacheManageFilter>,
    filter: Arc<CacheFilter>,
    upstream: Arc<HttpUpstream>,
) -> std::result::Result<Response<ImageBody>, Infallible> {
    let request = request.map(|body| BoxBody::new(body.map_err(ProxyError::from)));

    let response = match route(request, &manage, &filter, &upstream).await {
        Ok(response) => response,
        Err(ProxyError::NotFound(msg)) => {
            debug!("Request failed with not found: {}", msg);
            error_response(StatusCode::NOT_FOUND, msg)
        }
        Err(e) => {
            error!("Request failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    };
    Ok(response)
}

#[tokio::main]
async fn main() -> image_cache_proxy::Result<()> {
    let config = Config::from_args()?;
    init_logging(&config.log_level)?;

    info!(
        "Starting image cache proxy v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_address
    );
    info!(
        "Upstream: {}, registry: {}, cache dir: {}",
        config.upstream_address,
        config.registry_url,
        config.cache_dir.display()
    );

    let cache = Arc::new(DiskImageCache::new(config.cache_dir.clone(), config.chunk_size).await?);
    let registry = Arc::new(HttpRegistry::new(&config.registry_url));
    let manage = Arc::new(CacheManageFilter::new(cache.clone()));
    let filter = Arc::new(CacheFilter::new(
        cache,
        registry,
        Arc::new(ImageResponseSerializer),
    ));
    let upstream = Arc::new(HttpUpstream::new(&config.upstream_address));

    let addr: SocketAddr = config
        .listen_address
        .parse()
        .map_err(|e| ProxyError::ConfigError(format!("invalid listen address: {}", e)))?;
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    loop {
        let (stream, client_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping");
                break;
            }
        };

        debug!("Accepted connection from {}", client_addr);
        let io = TokioIo::new(stream);
        let manage = manage.clone();
        let filter = filter.clone();
        let upstream = upstream.clone();

        tokio::spawn(async move {
            let service = service_fn(move |request| {
                serve(request, manage.clone(), filter.clone(), upstream.clone())
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection from {} ended: {}", client_addr, e);
            }
        });
    }

    Ok(())
}
