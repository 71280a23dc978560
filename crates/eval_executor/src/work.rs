//! The unit of work the engine drives, one call per input item.

use std::future::Future;

use tower::{Service, ServiceExt};

/// One independent, retryable call for one input.
///
/// Implemented for every `Fn(I) -> impl Future<Output = Result<O, E>>` closure, and for
/// any cloneable [`tower::Service`] through [`ServiceWork`]. The returned future does not
/// need to be `Send`: the cooperative strategy polls it in place and the worker pool
/// drives it on the worker's own thread.
pub trait Work<I>: Send + Sync {
    type Output: Send;
    type Error: Send;

    fn call(&self, input: I) -> impl Future<Output = Result<Self::Output, Self::Error>>;
}

impl<I, F, Fut, O, E> Work<I> for F
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, E>>,
    O: Send,
    E: Send,
{
    type Output = O;
    type Error = E;

    fn call(&self, input: I) -> impl Future<Output = Result<O, E>> {
        self(input)
    }
}

/// Adapts a `tower::Service` into a unit of work. Each attempt calls a fresh clone of
/// the service, waiting for it to become ready first.
#[derive(Clone, Debug)]
pub struct ServiceWork<S> {
    service: S,
}

impl<S> ServiceWork<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn into_inner(self) -> S {
        self.service
    }
}

impl<I, S> Work<I> for ServiceWork<S>
where
    S: Service<I> + Clone + Send + Sync,
    S::Response: Send,
    S::Error: Send,
{
    type Output = S::Response;
    type Error = S::Error;

    fn call(&self, input: I) -> impl Future<Output = Result<S::Response, S::Error>> {
        self.service.clone().oneshot(input)
    }
}
