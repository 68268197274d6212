use axum::http::HeaderName;
use axum::Router;
use tokio::net::{TcpListener, ToSocketAddrs};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::delayed::{DelayedRoute, Payload};
use crate::scheduled::ScheduledRoute;

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Collects task routes (and any other routers) into one service.
#[derive(Clone, Default)]
pub struct TaskApp {
    pub router: Router<()>,
}

impl TaskApp {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
        }
    }

    /// Mount a delayed route's submit and execute endpoints.
    pub fn delayed<I: Payload>(mut self, route: &DelayedRoute<I>) -> Self {
        self.router = self.router.merge(route.router());
        self
    }

    pub fn scheduled<I: Payload>(mut self, route: &ScheduledRoute<I>) -> Self {
        self.router = self.router.merge(route.router());
        self
    }

    pub fn use_router(mut self, path: &str, router: Router<()>) -> Self {
        self.router = self.router.nest(path, router);
        self
    }

    pub fn merge(mut self, router: Router<()>) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// The router with tracing and `x-request-id` layers applied.
    pub fn into_router(self) -> Router<()> {
        self.router.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER, MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(REQUEST_ID_HEADER)),
        )
    }

    pub async fn listen<A>(self, addr: A) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = ?listener.local_addr().ok(), "listening");
        axum::serve(listener, self.into_router()).await?;
        Ok(())
    }
}

pub fn tasks() -> TaskApp {
    TaskApp::new()
}
