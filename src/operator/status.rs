//! Peer status exchange
//!
//! Every operator exposes `GET /status` with its controller state and, while
//! seeking a seeder, the newest snapshot revision it knows of. During
//! `evaluate`, the controller polls every peer's endpoint in parallel;
//! unreachable peers are logged and omitted.

use axum::extract::State as AxumState;
use axum::routing::get;
use axum::{Json, Router};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::decision::{PeerState, State};
use crate::providers::asg::Instance;

pub const STATUS_PORT: u16 = 2378;

/// The JSON payload served on `/status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: State,
    pub revision: i64,
}

impl Default for StatusPayload {
    fn default() -> Self {
        Self {
            state: State::Unknown,
            revision: 0,
        }
    }
}

pub type SharedStatus = Arc<RwLock<StatusPayload>>;

/// Serve the status endpoint until the process exits.
pub async fn serve(shared: SharedStatus, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/status", get(status_handler))
        .with_state(shared);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port = port, "status endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status_handler(AxumState(shared): AxumState<SharedStatus>) -> Json<StatusPayload> {
    Json(*shared.read().await)
}

/// Poll every instance's status endpoint in parallel, best effort.
pub async fn fetch_peer_states(
    http: &reqwest::Client,
    instances: &[Instance],
) -> Vec<PeerState> {
    let fetches = instances.iter().map(|instance| async move {
        match fetch_peer_state(http, instance).await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(
                    peer = %instance.name,
                    error = %e,
                    "failed to query peer's operator instance"
                );
                None
            }
        }
    });

    join_all(fetches).await.into_iter().flatten().collect()
}

async fn fetch_peer_state(
    http: &reqwest::Client,
    instance: &Instance,
) -> anyhow::Result<PeerState> {
    let url = format!("http://{}:{}/status", instance.address, STATUS_PORT);
    let payload: StatusPayload = http.get(&url).send().await?.json().await?;

    Ok(PeerState {
        name: instance.name.clone(),
        state: payload.state,
        revision: payload.revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_payload_json() {
        let payload = StatusPayload {
            state: State::Start,
            revision: 0x2a,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"state":"START","revision":42}"#);

        let parsed: StatusPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.state, State::Start);
        assert_eq!(parsed.revision, 0x2a);
    }

    #[tokio::test]
    async fn test_serve_and_fetch_round_trip() {
        let shared: SharedStatus = Arc::new(RwLock::new(StatusPayload {
            state: State::Ok,
            revision: 7,
        }));

        // Bind on an ephemeral port to avoid clashing with other tests.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new()
            .route("/status", get(status_handler))
            .with_state(shared);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let http = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/status", port);
        let payload: StatusPayload = http.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(payload.state, State::Ok);
        assert_eq!(payload.revision, 7);
    }

    #[tokio::test]
    async fn test_unreachable_peers_are_omitted() {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        let instances = vec![Instance {
            name: "ghost".to_string(),
            address: "127.0.0.1".to_string(),
        }];

        // Nothing listens on the status port of 127.0.0.1 in the test
        // environment, so the peer is dropped rather than failing the tick.
        let states = fetch_peer_states(&http, &instances).await;
        assert!(states.is_empty());
    }
}
