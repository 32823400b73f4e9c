//! Single-shot network calls against the backend session service.
//!
//! Only "can this one call be issued" lives here; whether an operation
//! should be retried is the controller's call.

use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("bad response status={status} body={body:?} from {url}")]
    BadStatus {
        url: String,
        status: u16,
        body: String,
    },
}

/// Fetched JSON body plus the status it arrived with.
#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub status: u16,
    pub json: Value,
}

pub struct ResolutionClient {
    http: reqwest::Client,
}

impl ResolutionClient {
    /// The cookie store stands in for the browser's `credentials: include`:
    /// the backend sets session cookies on success and expects them back.
    pub fn new() -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { http })
    }

    /// POST a JSON body. 200 and 201 are success; everything else, and any
    /// transport failure, rejects with a descriptive error.
    pub async fn post_json(&self, url: &Url, body: &Value) -> Result<FetchedJson, FetchError> {
        let response = self
            .http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        if status == 200 || status == 201 {
            // A success with an unparseable body still counts; the caller
            // only reads the fields it can find.
            let json = serde_json::from_str(&text).unwrap_or_else(|_| Value::Object(Map::new()));
            Ok(FetchedJson { status, json })
        } else {
            Err(FetchError::BadStatus {
                url: url.to_string(),
                status,
                body: text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, routing::post, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Clone)]
    struct Reply {
        status: StatusCode,
        body: &'static str,
    }

    async fn reply(State(reply): State<Arc<Reply>>) -> (StatusCode, String) {
        (reply.status, reply.body.to_string())
    }

    async fn serve(status: StatusCode, body: &'static str) -> Url {
        let app = Router::new()
            .route("/resolve", post(reply))
            .with_state(Arc::new(Reply { status, body }));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Url::parse(&format!("http://{addr}/resolve")).expect("test url")
    }

    #[tokio::test]
    async fn ok_status_parses_the_body() {
        let url = serve(StatusCode::OK, r#"{"userInfo":{"newlyCreated":true}}"#).await;
        let client = ResolutionClient::new().expect("client");
        let fetched = client.post_json(&url, &json!({})).await.expect("success");
        assert_eq!(fetched.status, 200);
        assert_eq!(fetched.json["userInfo"]["newlyCreated"], json!(true));
    }

    #[tokio::test]
    async fn created_status_is_also_success() {
        let url = serve(StatusCode::CREATED, "{}").await;
        let client = ResolutionClient::new().expect("client");
        let fetched = client.post_json(&url, &json!({})).await.expect("success");
        assert_eq!(fetched.status, 201);
    }

    #[tokio::test]
    async fn invalid_success_body_yields_an_empty_object() {
        let url = serve(StatusCode::OK, "not json at all").await;
        let client = ResolutionClient::new().expect("client");
        let fetched = client.post_json(&url, &json!({})).await.expect("success");
        assert_eq!(fetched.json, json!({}));
    }

    #[tokio::test]
    async fn error_status_rejects_with_the_body_text() {
        let url = serve(StatusCode::INTERNAL_SERVER_ERROR, "backend exploded").await;
        let client = ResolutionClient::new().expect("client");
        let err = client.post_json(&url, &json!({})).await.expect_err("rejects");
        match err {
            FetchError::BadStatus { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "backend exploded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_rejects() {
        let url = Url::parse("http://127.0.0.1:1/resolve").expect("url");
        let client = ResolutionClient::new().expect("client");
        let err = client.post_json(&url, &json!({})).await.expect_err("rejects");
        assert!(matches!(err, FetchError::Transport { .. }));
    }
}
