//! Exact method + path route table.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chunkflow_body::{Request, Response};
use http::header::{ALLOW, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use tracing::debug;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A request handler.
///
/// Handlers return their response before its body is produced: a
/// streaming body is only pulled while the server writes it.
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<anyhow::Result<Response>> + Send + Sync>;

/// Outcome of looking up a request in the route table.
pub enum Resolved {
    Found(Handler),
    /// The path exists but not for this method; carries the allowed ones.
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

#[derive(Clone, Default)]
pub struct Routes {
    table: HashMap<String, Vec<(Method, Handler)>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method` requests to exactly `path`.
    ///
    /// Registering the same method and path twice replaces the handler.
    pub fn route<F, Fut>(mut self, method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |req: Request| -> BoxFuture<anyhow::Result<Response>> {
            Box::pin(handler(req))
        });
        let entries = self.table.entry(path.into()).or_default();
        entries.retain(|(m, _)| *m != method);
        entries.push((method, handler));
        self
    }

    pub fn get<F, Fut>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        self.route(Method::GET, path, handler)
    }

    pub fn post<F, Fut>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        self.route(Method::POST, path, handler)
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Resolved {
        let Some(entries) = self.table.get(path) else {
            return Resolved::NotFound;
        };
        match entries.iter().find(|(m, _)| m == method) {
            Some((_, handler)) => Resolved::Found(handler.clone()),
            None => Resolved::MethodNotAllowed(entries.iter().map(|(m, _)| m.clone()).collect()),
        }
    }

    /// Run the matching handler, or answer 404 / 405.
    pub async fn dispatch(&self, request: Request) -> anyhow::Result<Response> {
        match self.resolve(request.method(), request.uri().path()) {
            Resolved::Found(handler) => handler(request).await,
            Resolved::MethodNotAllowed(allowed) => {
                debug!(method = %request.method(), path = request.uri().path(), "method not allowed");
                let allow = allowed
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut headers = HeaderMap::new();
                headers.insert(ALLOW, HeaderValue::from_str(&allow)?);
                Ok(Response::new(StatusCode::METHOD_NOT_ALLOWED, headers, "Method Not Allowed"))
            }
            Resolved::NotFound => {
                debug!(path = request.uri().path(), "no route");
                Ok(Response::new(StatusCode::NOT_FOUND, HeaderMap::new(), "Not Found"))
            }
        }
    }
}
