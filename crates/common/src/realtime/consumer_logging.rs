use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::realtime::{ChangeFeedMessage, ChangeFeedResponse};
use tower::{Layer, Service};
use tracing::{error, info, warn, Instrument, Span};

/// Tower layer logging every consumed change-feed message
#[derive(Clone, Default)]
pub struct ChangeFeedLoggingLayer;

impl ChangeFeedLoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ChangeFeedLoggingLayer {
    type Service = ChangeFeedLoggingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ChangeFeedLoggingService { inner: service }
    }
}

#[derive(Clone)]
pub struct ChangeFeedLoggingService<S> {
    inner: S,
}

impl<S> Service<ChangeFeedMessage> for ChangeFeedLoggingService<S>
where
    S: Service<ChangeFeedMessage, Response = ChangeFeedResponse> + Clone + Send + 'static,
    S::Error: std::fmt::Display + Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, msg: ChangeFeedMessage) -> Self::Future {
        let channel = msg.channel.clone();
        let payload_size = msg.payload.len();
        let start = Instant::now();
        let mut inner = self.inner.clone();

        let span = Span::current();

        Box::pin(
            async move {
                let result = inner.call(msg).await;
                let duration_ms = start.elapsed().as_millis();

                match &result {
                    Ok(ChangeFeedResponse::Applied) => {
                        info!(
                            channel = %channel,
                            payload_bytes = payload_size,
                            outcome = "applied",
                            duration_ms = %duration_ms,
                            "consumed from {channel} in {duration_ms}ms [applied]"
                        );
                    }
                    Ok(ChangeFeedResponse::Dropped(reason)) => {
                        warn!(
                            channel = %channel,
                            payload_bytes = payload_size,
                            outcome = "dropped",
                            reason = reason.as_deref().unwrap_or("unspecified"),
                            duration_ms = %duration_ms,
                            "consumed from {channel} in {duration_ms}ms [dropped]"
                        );
                    }
                    Err(e) => {
                        error!(
                            channel = %channel,
                            payload_bytes = payload_size,
                            duration_ms = %duration_ms,
                            error = %e,
                            "failed to consume from {channel} in {duration_ms}ms: {e}"
                        );
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}
