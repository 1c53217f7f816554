//! Middleware trait and the request chain

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Body type alias
pub type Body = Full<Bytes>;

/// Boxed future returned by a [`HandlerFn`]
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response<Body>>> + Send>>;

/// Middleware trait for request/response processing
#[async_trait]
pub trait Middleware: Send + Sync + fmt::Debug {
    /// Process a request
    ///
    /// # Arguments
    ///
    /// * `req` - The incoming HTTP request
    /// * `next` - The rest of the chain, ending in the wrapped handler
    async fn call(&self, req: Request<Body>, next: Next) -> Result<Response<Body>>;
}

/// Type alias for the final handler function
pub type HandlerFn = Box<dyn Fn(Request<Body>) -> HandlerFuture + Send + Sync>;

/// Box an async closure into a [`HandlerFn`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>>> + Send + 'static,
{
    Box::new(move |req| Box::pin(f(req)))
}

/// Represents the next middleware/handler in the chain
pub struct Next {
    middleware_stack: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    final_handler: Option<Arc<HandlerFn>>,
}

impl Next {
    /// Create a new Next from a middleware stack
    pub fn new(middleware_stack: Arc<[Arc<dyn Middleware>]>) -> Self {
        Self {
            middleware_stack,
            index: 0,
            final_handler: None,
        }
    }

    /// Create a new Next with a final handler
    pub fn with_handler(middleware_stack: Arc<[Arc<dyn Middleware>]>, handler: HandlerFn) -> Self {
        Self::with_shared_handler(middleware_stack, Arc::new(handler))
    }

    /// Create a new Next around a handler that is shared between requests
    pub fn with_shared_handler(
        middleware_stack: Arc<[Arc<dyn Middleware>]>,
        handler: Arc<HandlerFn>,
    ) -> Self {
        Self {
            middleware_stack,
            index: 0,
            final_handler: Some(handler),
        }
    }

    /// A chain with no middleware, only the handler
    pub fn handler(handler: HandlerFn) -> Self {
        Self::with_handler(Arc::new([]), handler)
    }

    /// Run the next middleware or final handler
    pub async fn run(self, req: Request<Body>) -> Result<Response<Body>> {
        if let Some(middleware) = self.middleware_stack.get(self.index) {
            let next = Self {
                middleware_stack: Arc::clone(&self.middleware_stack),
                index: self.index + 1,
                final_handler: self.final_handler.clone(),
            };
            middleware.call(req, next).await
        } else if let Some(handler) = self.final_handler {
            handler(req).await
        } else {
            tracing::error!(index = self.index, "Middleware chain has no handler");
            Err(Error::Internal(
                "Middleware chain completed without handler".to_string(),
            ))
        }
    }
}

impl Clone for Next {
    fn clone(&self) -> Self {
        Self {
            middleware_stack: Arc::clone(&self.middleware_stack),
            index: self.index,
            final_handler: self.final_handler.clone(),
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &(self.middleware_stack.len() - self.index))
            .field("has_handler", &self.final_handler.is_some())
            .finish()
    }
}

/// Wrap a handler in a middleware stack, producing a new handler
///
/// Lets the chain be dropped into any pipeline that only knows about plain
/// handler functions.
pub fn wrap(middleware_stack: Arc<[Arc<dyn Middleware>]>, handler: HandlerFn) -> HandlerFn {
    let handler = Arc::new(handler);
    Box::new(move |req| {
        let next = Next::with_shared_handler(Arc::clone(&middleware_stack), Arc::clone(&handler));
        Box::pin(next.run(req))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[derive(Debug)]
    struct Tag {
        name: &'static str,
    }

    #[async_trait]
    impl Middleware for Tag {
        async fn call(&self, req: Request<Body>, next: Next) -> Result<Response<Body>> {
            let mut response = next.run(req).await?;
            response
                .headers_mut()
                .append("x-seen", HeaderValue::from_static(self.name));
            Ok(response)
        }
    }

    fn ok_handler() -> HandlerFn {
        handler_fn(|_req| async { Ok(Response::new(Body::from("done"))) })
    }

    #[tokio::test]
    async fn test_chain_without_handler_errors() {
        let stack: Arc<[Arc<dyn Middleware>]> = Arc::new([Arc::new(Tag { name: "first" })]);
        let req = Request::builder().uri("/test").body(Body::from("")).unwrap();

        let result = Next::new(stack).run(req).await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let stack: Arc<[Arc<dyn Middleware>]> = Arc::new([
            Arc::new(Tag { name: "outer" }) as Arc<dyn Middleware>,
            Arc::new(Tag { name: "inner" }),
        ]);
        let req = Request::builder().uri("/test").body(Body::from("")).unwrap();

        let response = Next::with_handler(stack, ok_handler()).run(req).await.unwrap();
        let seen: Vec<_> = response
            .headers()
            .get_all("x-seen")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        // Responses unwind inner first
        assert_eq!(seen, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn test_wrap_is_reusable() {
        let stack: Arc<[Arc<dyn Middleware>]> = Arc::new([Arc::new(Tag { name: "only" })]);
        let wrapped = wrap(stack, ok_handler());

        for _ in 0..2 {
            let req = Request::builder().uri("/").body(Body::from("")).unwrap();
            let response = wrapped(req).await.unwrap();
            assert_eq!(response.headers()["x-seen"], "only");
        }
    }
}
