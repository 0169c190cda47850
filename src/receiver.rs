//! HTTP endpoint that accepts update signals.
//!
//! A signal is a `POST /?<secret>` whose body names a container or image.
//! Every request goes through the rate limiter and the secret check before
//! the body is touched.  Any other method is answered with `400`.  All
//! responses are fixed plain-text strings.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, Request};
use axum::response::IntoResponse;
use axum::Router;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::error::SignalError;
use crate::rate_limit::{Authenticator, RateLimiter};
use crate::token_store::{sanitize, TokenStore};

#[derive(Clone)]
pub struct ReceiverState {
    limiter: Arc<Mutex<RateLimiter>>,
    auth: Arc<Authenticator>,
    store: Arc<TokenStore>,
    max_body_bytes: usize,
}

impl ReceiverState {
    pub fn new(
        limiter: RateLimiter,
        auth: Authenticator,
        store: Arc<TokenStore>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            limiter: Arc::new(Mutex::new(limiter)),
            auth: Arc::new(auth),
            store,
            max_body_bytes,
        }
    }
}

pub fn router(state: ReceiverState) -> Router {
    Router::new().fallback(receive_signal).with_state(state)
}

/// Serve signals on `bind` until `shutdown` resolves.
pub async fn serve(
    bind: SocketAddr,
    state: ReceiverState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("Signal receiver listening on {}", bind);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn receive_signal(
    State(state): State<ReceiverState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Result<impl IntoResponse, SignalError> {
    if request.method() != Method::POST {
        return Err(SignalError::BadRequest);
    }

    let source = peer.ip().to_string();
    if let Err(e) = state.limiter.lock().await.check(&source) {
        warn!("Rate limited signal from {}", source);
        return Err(e);
    }

    let supplied = (request.uri().path() == "/")
        .then(|| request.uri().query())
        .flatten();
    if let Err(e) = state.auth.verify(supplied) {
        warn!("Rejected unauthenticated signal from {}", source);
        return Err(e);
    }

    let body = to_bytes(request.into_body(), state.max_body_bytes)
        .await
        .map_err(|_| SignalError::BadRequest)?;
    let token = sanitize(&String::from_utf8_lossy(&body));

    state.store.append(&token).await.map_err(|e| {
        error!(
            "Failed to append signal to {}: {}",
            state.store.path().display(),
            e
        );
        SignalError::Storage(e)
    })?;
    info!("Recorded signal {:?} from {}", token, source);

    Ok(([(header::CONTENT_TYPE, "text/plain")], "200 OK"))
}
