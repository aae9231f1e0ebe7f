// SPDX-License-Identifier: Apache-2.0

//! HTTP exposition endpoint.
//!
//! Serves the current store snapshot to a scraping collector: text format
//! on `GET /metrics`, the same snapshot as JSON on `GET /json`.

use std::error::Error as StdError;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Method;
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::error;

use crate::listener::Listener;

use super::exposition::render_text;
use super::store::MetricStore;

pub struct ExpositionServer {
    addr: SocketAddr,
    store: Arc<MetricStore>,
}

impl ExpositionServer {
    pub fn new(addr: SocketAddr, store: Arc<MetricStore>) -> Self {
        Self { addr, store }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve scrape requests until cancelled, then shut down open
    /// connections gracefully.
    pub async fn serve(
        &self,
        listener: Listener,
        cancellation: CancellationToken,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        let svc = TowerToHyperService::new(ExpositionService {
            store: self.store.clone(),
        });

        let timer = hyper_util::rt::TokioTimer::new();
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();

        let mut builder = Builder::new(TokioExecutor::new());
        builder.http1().timer(timer.clone());
        builder.http2().timer(timer);

        let listener = listener.into_async()?;
        loop {
            let stream = tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, _)) => stream,
                        Err(e) => return Err(e.into()),
                    }
                },
                _ = cancellation.cancelled() => break
            };

            let io = TokioIo::new(stream);

            let conn = builder.serve_connection(io, svc.clone());
            let fut = graceful.watch(conn.into_owned());

            tokio::spawn(async move {
                let _ = fut.await.map_err(|e| {
                    error!("error serving exposition connection: {:?}", e);
                });
            });
        }

        graceful.shutdown().await;

        Ok(())
    }
}

#[derive(Clone)]
struct ExpositionService {
    store: Arc<MetricStore>,
}

impl<H> Service<Request<H>> for ExpositionService
where
    H: Body + Send + Sync + 'static,
    <H as Body>::Data: Send + Sync + Clone,
    <H as Body>::Error: Display + Debug + Send + Sync + ToString,
{
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<H>) -> Self::Future {
        let response = match (req.method(), req.uri().path()) {
            (&Method::GET, "/metrics") => {
                let text = render_text(&self.store.snapshot());
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; charset=utf-8")
                    .body(Full::new(Bytes::from(text)))
                    .unwrap()
            }
            (&Method::GET, "/json") => match serde_json::to_vec(&self.store.snapshot()) {
                Ok(body) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap(),
                Err(err) => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(format!("failed to render: {}", err))))
                    .unwrap(),
            },
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from_static(b"Not Found")))
                .unwrap(),
        };

        Box::pin(futures::future::ok(response))
    }
}
