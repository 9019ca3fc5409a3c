//! HTTP management surface of the agent.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::Error;
use crate::agent::Agent;
use crate::model::NetworkModel;

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/net-model.json", get(get_net_model).put(put_net_model))
        .route("/net-config.gv", get(get_net_config))
        .route("/sdn-status.json", get(get_sdn_status))
        .layer(middleware::from_fn(log_request))
        .with_state(agent)
}

async fn log_request(req: Request<Body>, next: Next) -> Response {
    info!(method = %req.method(), path = %req.uri().path(), "HTTP request");
    next.run(req).await
}

async fn get_net_model(State(agent): State<Arc<Agent>>) -> Json<NetworkModel> {
    Json(agent.model().await)
}

async fn put_net_model(State(agent): State<Arc<Agent>>, body: Bytes) -> Response {
    let model: NetworkModel = match serde_json::from_slice(&body) {
        Ok(model) => model,
        Err(e) => {
            let msg = format!("failed to unmarshal network model: {e}");
            return (StatusCode::BAD_REQUEST, msg).into_response();
        }
    };
    match agent.apply_model(model).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(
            e @ (Error::Validation(_)
            | Error::Dependencies(_)
            | Error::Ipam(_)
            | Error::NotImplemented(_)),
        ) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn get_net_config(State(agent): State<Arc<Agent>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/vnd.graphviz")],
        agent.intended_dot(),
    )
        .into_response()
}

async fn get_sdn_status(State(agent): State<Arc<Agent>>) -> Response {
    Json(agent.status().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::netlink::NetworkMonitor;

    fn agent() -> Arc<Agent> {
        Arc::new(Agent::new(
            Arc::new(Config::default()),
            NetworkMonitor::detached(8, Vec::new()),
        ))
    }

    const MODEL: &str = r#"{
        "ports": [{"logicalLabel": "eth1", "mac": "02:fe:00:00:00:01", "adminUP": true}],
        "bridges": [{"logicalLabel": "br0", "ports": ["eth1"]}],
        "networks": [{"logicalLabel": "lan", "bridge": "br0",
                      "subnet": "172.22.1.0/24", "gwIP": "172.22.1.1"}],
        "host": {"hostIPs": ["192.168.0.10"], "controllerPort": 3333}
    }"#;

    #[tokio::test]
    async fn put_then_get() {
        let agent = agent();
        let resp = put_net_model(State(agent.clone()), Bytes::from_static(MODEL.as_bytes())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let Json(model) = get_net_model(State(agent.clone())).await;
        assert_eq!(model.networks[0].logical_label, "lan");

        let resp = get_net_config(State(agent)).await;
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/vnd.graphviz");
    }

    #[tokio::test]
    async fn bad_models_are_rejected() {
        let agent = agent();
        let resp = put_net_model(State(agent.clone()), Bytes::from_static(b"{not json")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let duplicate = MODEL.replace(
            r#""bridges": [{"logicalLabel": "br0", "ports": ["eth1"]}]"#,
            r#""bridges": [{"logicalLabel": "br0", "ports": ["eth1"]},
                           {"logicalLabel": "br0"}]"#,
        );
        let resp = put_net_model(State(agent.clone()), Bytes::from(duplicate)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(agent.model().await.ports.is_empty());
    }
}
