//! Tower middleware enforcing admission on `http` requests.
//!
//! For every request the layer asks the [`AdmissionGuard`]; rejected requests are
//! answered with `429 Too Many Requests` without reaching the inner service. Admitted
//! requests carry their [`RateLimitInfo`] in the request extensions, and the
//! rate-limit headers are added to the response, or attached to the error when the
//! inner service fails.
//!
//! The server must record the connected peer as a [`PeerAddr`] (or `SocketAddr`)
//! extension. A request without one is refused with
//! [`AdmissionServiceError::MissingPeer`] instead of being counted against a shared
//! placeholder address.

use crate::error::AdmissionError;
use crate::guard::{Admission, AdmissionGuard, AdmissionRequest, RateLimitInfo};
use crate::headers;
use crate::rate_limit::CounterStore;
use futures::future::BoxFuture;
use http::{HeaderMap, Request, Response, StatusCode};
use pin_project::pin_project;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

/// Address of the directly connected peer, inserted by the server.
///
/// A bare `SocketAddr` extension is accepted as well. One of the two is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub IpAddr);

/// Explicit policy tier for the request, inserted by an upstream layer (for
/// example after authentication).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier(pub Arc<str>);

/// Error returned by [`AdmissionService`].
#[derive(Debug, Error)]
pub enum AdmissionServiceError<E> {
    /// The inner service failed. `headers` are the rate-limit headers the response
    /// would have carried, for the framework's error handler to emit.
    #[error("handler failed: {source}")]
    Handler {
        #[source]
        source: E,
        headers: HeaderMap,
    },
    /// The counter store is unavailable and fail-open is disabled.
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    /// The request carried neither a [`PeerAddr`] nor a `SocketAddr` extension, so
    /// there is no identity to count it against.
    #[error("request carries no peer address")]
    MissingPeer,
}

impl<E> AdmissionServiceError<E> {
    /// Rate-limit headers to emit alongside the error response.
    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            AdmissionServiceError::Handler { headers, .. } => Some(headers),
            AdmissionServiceError::Admission(_) | AdmissionServiceError::MissingPeer => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            AdmissionServiceError::Handler { source, .. } => Some(source),
            AdmissionServiceError::Admission(_) | AdmissionServiceError::MissingPeer => None,
        }
    }
}

/// A layer that applies an [`AdmissionGuard`] to every request.
///
/// Requests must carry the connected peer address; see [`PeerAddr`].
pub struct AdmissionLayer<S> {
    guard: AdmissionGuard<S>,
}

impl<S> AdmissionLayer<S> {
    pub fn new(guard: AdmissionGuard<S>) -> Self {
        Self { guard }
    }
}

impl<S> Clone for AdmissionLayer<S> {
    fn clone(&self) -> Self {
        Self { guard: self.guard.clone() }
    }
}

impl<Inner, S> Layer<Inner> for AdmissionLayer<S> {
    type Service = AdmissionService<Inner, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AdmissionService { inner, guard: self.guard.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<Inner, S> {
    inner: Inner,
    guard: AdmissionGuard<S>,
}

impl<Inner: Clone, S> Clone for AdmissionService<Inner, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), guard: self.guard.clone() }
    }
}

impl<Inner, S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<Inner, S>
where
    Inner: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Error: Send + 'static,
    S: CounterStore + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = AdmissionServiceError<Inner::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map_err(|source| AdmissionServiceError::Handler { source, headers: HeaderMap::new() })
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // Drive the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let guard = self.guard.clone();

        Box::pin(async move {
            let Some(peer) = peer_addr(&req) else {
                tracing::warn!(path = req.uri().path(), "Request has no peer address, refusing admission");
                return Err(AdmissionServiceError::MissingPeer);
            };
            let admission = {
                let tier = req.extensions().get::<Tier>().map(|t| t.0.clone());
                let request = AdmissionRequest::new(peer, req.headers(), req.uri().path())
                    .with_tier(tier.as_deref());
                guard.admit(&request).await?
            };

            match admission {
                Admission::Bypassed => inner.call(req).await.map_err(|source| {
                    AdmissionServiceError::Handler { source, headers: HeaderMap::new() }
                }),
                Admission::Rejected(rejection) => {
                    let mut response = Response::new(ResBody::default());
                    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                    headers::apply(response.headers_mut(), &headers::rejection_headers(&rejection));
                    Ok(response)
                }
                Admission::Allowed(info) => {
                    let emitted = headers::rate_limit_headers(&info, false);
                    req.extensions_mut().insert::<RateLimitInfo>(info);
                    EmitHeaders { inner: inner.call(req), headers: Some(emitted) }.await
                }
            }
        })
    }
}

/// Adds rate-limit headers to whatever the inner service produces.
#[pin_project]
struct EmitHeaders<F> {
    #[pin]
    inner: F,
    headers: Option<HeaderMap>,
}

impl<F, B, E> Future for EmitHeaders<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<B>, AdmissionServiceError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = match this.inner.poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };
        let emitted = this.headers.take().unwrap_or_default();
        Poll::Ready(match result {
            Ok(mut response) => {
                headers::apply(response.headers_mut(), &emitted);
                Ok(response)
            }
            Err(source) => Err(AdmissionServiceError::Handler { source, headers: emitted }),
        })
    }
}

fn peer_addr<B>(req: &Request<B>) -> Option<IpAddr> {
    let extensions = req.extensions();
    extensions
        .get::<PeerAddr>()
        .map(|PeerAddr(ip)| *ip)
        .or_else(|| extensions.get::<SocketAddr>().map(SocketAddr::ip))
}
