//! The gateway server: loads descriptor sets, multiplexes gRPC and plain
//! HTTP on one listener, and routes every unknown-at-compile-time method
//! through the dynamic call path.

use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::header::CONTENT_TYPE;
use http::HeaderValue;
use tower::ServiceExt;

use crate::config::ServerConfig;
use crate::evaluator::Evaluator;
use crate::httprule::{collect_rules, serve_http, BoundRule};
use crate::method::MethodCall;
use crate::vfs::StackedFs;
use crate::ServeError;
use gantry_reflection::{ReflectionService, ServerReflectionServer};
use gantry_registry::Registry;

const REFLECTION_PREFIX: &str = "/grpc.reflection.v1alpha.ServerReflection/";

pub struct Server {
    config: ServerConfig,
    registry: Registry,
    evaluator: Arc<dyn Evaluator>,
}

impl Server {
    /// Builds the registry from the configured descriptor sources. A
    /// malformed descriptor set is logged and skipped; the rest still load.
    pub fn new(config: ServerConfig, evaluator: Arc<dyn Evaluator>) -> Result<Self, ServeError> {
        let mut registry = Registry::new();
        for path in &config.protosets {
            let bytes = std::fs::read(path).map_err(|source| ServeError::ReadDescriptorSet {
                path: path.display().to_string(),
                source,
            })?;
            add_descriptor_set(&mut registry, &bytes, &path.display().to_string());
        }
        let vfs = StackedFs::new(config.dirs.iter().cloned());
        if !vfs.is_empty() {
            for name in vfs.descriptor_files()? {
                let bytes = vfs.read(&name)?;
                add_descriptor_set(&mut registry, &bytes, &name);
            }
        }
        Ok(Self { config, registry, evaluator })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The combined router: gRPC requests (by content type) go to the
    /// reflection service or the dynamic dispatcher; everything else goes
    /// to the HTTP transcoder when enabled.
    pub fn router(&self) -> Router {
        let gateway = Gateway {
            registry: self.registry.clone(),
            evaluator: self.evaluator.clone(),
            reflection: ReflectionService::new(&self.registry).into_server(),
            rules: Arc::new(if self.config.http {
                collect_rules(&self.registry, &self.config.rule_templates)
            } else {
                Vec::new()
            }),
            http: self.config.http,
        };
        Router::new().fallback(dispatch).with_state(gateway)
    }

    pub async fn serve(self) -> Result<(), ServeError> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen)
            .await
            .map_err(|source| ServeError::Bind { addr: self.config.listen.clone(), source })?;
        self.serve_on(listener).await
    }

    pub async fn serve_on(self, listener: tokio::net::TcpListener) -> Result<(), ServeError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening");
        }
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    pub async fn serve_with_shutdown<F>(
        self,
        listener: tokio::net::TcpListener,
        shutdown: F,
    ) -> Result<(), ServeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening");
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

fn add_descriptor_set(registry: &mut Registry, bytes: &[u8], source: &str) {
    match registry.add_descriptor_set_bytes(bytes) {
        Ok(()) => tracing::debug!(source, "loaded descriptor set"),
        Err(err) => tracing::error!(source, %err, "skipping descriptor set"),
    }
}

#[derive(Clone)]
struct Gateway {
    registry: Registry,
    evaluator: Arc<dyn Evaluator>,
    reflection: ServerReflectionServer<ReflectionService>,
    rules: Arc<Vec<BoundRule>>,
    http: bool,
}

async fn dispatch(State(gateway): State<Gateway>, req: http::Request<Body>) -> Response {
    let is_grpc = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/grpc"))
        .unwrap_or(false);
    if is_grpc {
        return gateway.dispatch_grpc(req).await;
    }
    if gateway.http {
        return serve_http(&gateway.rules, &gateway.evaluator, req).await;
    }
    http::StatusCode::NOT_FOUND.into_response()
}

impl Gateway {
    /// Two-phase gRPC dispatch: the statically generated reflection service
    /// first, then dynamic resolution of the path's fully qualified name.
    async fn dispatch_grpc(&self, req: http::Request<Body>) -> Response {
        let path = req.uri().path();
        if path.starts_with(REFLECTION_PREFIX) {
            return match self.reflection.clone().oneshot(req).await {
                Ok(resp) => resp.map(Body::new),
                Err(err) => match err {},
            };
        }

        let fqn = path.trim_start_matches('/').replace('/', ".");
        match self.registry.method_by_full_name(&fqn) {
            Some(method) => {
                tracing::debug!(method = %fqn, "dispatching");
                let call = MethodCall::new(method, self.evaluator.clone());
                call.call(req).await.map(Body::new)
            }
            None => {
                tracing::debug!(method = %fqn, "unimplemented");
                unimplemented_response(&fqn)
            }
        }
    }
}

/// The gRPC-level "no such method" answer: HTTP 200 with the status in the
/// grpc headers, carrying the attempted name.
fn unimplemented_response(fqn: &str) -> Response {
    let message = HeaderValue::try_from(format!("method not found: {fqn}"))
        .unwrap_or_else(|_| HeaderValue::from_static("method not found"));
    match http::Response::builder()
        .status(http::StatusCode::OK)
        .header("grpc-status", tonic::Code::Unimplemented as i32)
        .header("grpc-message", message)
        .header(CONTENT_TYPE, "application/grpc")
        .body(Body::empty())
    {
        Ok(resp) => resp,
        Err(err) => {
            tracing::error!(%err, "cannot build unimplemented response");
            http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
