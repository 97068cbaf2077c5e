//! HTTP engine: an axum router that remembers what was registered on it.

use std::sync::Arc;

use axum::handler::Handler;
use axum::http::Method;
use axum::routing::{on, MethodFilter};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;

/// One registered route, as reported by the route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub method: String,
    pub path: String,
    pub handler: String,
}

/// Router under construction plus its route table.
#[derive(Default)]
pub struct Engine {
    router: Router<Arc<Runtime>>,
    routes: Vec<RouteInfo>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method` on `path`.
    pub fn route<H, T>(&mut self, method: Method, path: &str, handler: H) -> &mut Self
    where
        H: Handler<T, Arc<Runtime>>,
        T: 'static,
    {
        let filter = match MethodFilter::try_from(method.clone()) {
            Ok(filter) => filter,
            Err(_) => {
                tracing::warn!(method = %method, path, "Unsupported method, route skipped");
                return self;
            }
        };

        let router = std::mem::take(&mut self.router);
        self.router = router.route(path, on(filter, handler));
        self.routes.push(RouteInfo {
            method: method.to_string(),
            path: path.to_string(),
            handler: std::any::type_name::<H>().to_string(),
        });
        self
    }

    /// Apply a transformation to the underlying router (layers, nesting).
    pub fn map_router(&mut self, f: impl FnOnce(Router<Arc<Runtime>>) -> Router<Arc<Runtime>>) -> &mut Self {
        let router = std::mem::take(&mut self.router);
        self.router = f(router);
        self
    }

    pub fn routes(&self) -> &[RouteInfo] {
        &self.routes
    }

    pub fn into_router(self) -> Router<Arc<Runtime>> {
        self.router
    }
}
