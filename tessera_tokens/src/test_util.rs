//! A simulated auth backend for exercising the session without a network

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use serde_json::{json, Value};
use tessera_clock::{TestClock, UnixTime};
use tokio::sync::Notify;
use url::Url;

use crate::SessionConfig;

pub const LOGIN: &str = "auth/google/login";
pub const CALLBACK: &str = "auth/google/callback";
pub const REFRESH: &str = "auth/token/refresh";
pub const LOGOUT: &str = "auth/logout";

pub const CLIENT_ID: &str = "client-123.apps.example.com";
pub const EMAIL: &str = "ada@example.com";
pub const NOW: UnixTime = UnixTime(1_700_000_000);

pub fn config() -> SessionConfig {
    SessionConfig::new(
        Url::parse("https://api.example.com/dev").expect("static URL"),
        CLIENT_ID,
    )
    .expect("static config")
}

pub fn clock() -> TestClock {
    TestClock::new(NOW)
}

pub fn access_token(exp: UnixTime, tag: &str) -> String {
    tessera_jwt::testing::forge_unsigned(&json!({ "sub": "user-1", "exp": exp.0, "jti": tag }))
}

pub fn id_token(email: &str) -> String {
    tessera_jwt::testing::forge_unsigned(&json!({
        "sub": "user-1",
        "email": email,
        "name": "Ada Lovelace",
        "exp": NOW.0 + 3600,
    }))
}

pub fn fresh_access(tag: &str) -> String {
    access_token(UnixTime(NOW.0 + 3600), tag)
}

pub fn expired_access(tag: &str) -> String {
    access_token(UnixTime(NOW.0 - 60), tag)
}

pub fn issued(access: &str, refresh: Option<&str>) -> Value {
    let mut body = json!({ "accessToken": access, "idToken": id_token(EMAIL) });
    if let Some(refresh) = refresh {
        body["refreshToken"] = json!(refresh);
    }
    body
}

#[derive(Clone, Debug)]
pub enum Reply {
    Json(StatusCode, Value),
    Text(StatusCode, &'static str),
    TransportError,
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub path: String,
    pub body: Value,
    pub authorization: Option<String>,
}

/// Terminal middleware answering the auth endpoints from canned replies
#[derive(Default)]
pub struct MockAuthServer {
    replies: Mutex<HashMap<&'static str, Reply>>,
    gates: Mutex<HashMap<&'static str, Arc<Notify>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockAuthServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, endpoint: &'static str, reply: Reply) {
        self.replies.lock().unwrap().insert(endpoint, reply);
    }

    pub fn reply_json(&self, endpoint: &'static str, body: Value) {
        self.reply(endpoint, Reply::Json(StatusCode::OK, body));
    }

    /// Holds every response from `endpoint` until the returned handle is
    /// notified once per held request
    pub fn hold(&self, endpoint: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(endpoint, gate.clone());
        gate
    }

    pub fn client(self: &Arc<Self>) -> ClientWithMiddleware {
        ClientBuilder::new(reqwest::Client::default())
            .with_arc(self.clone())
            .build()
    }

    pub fn calls_to(&self, endpoint: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.path == endpoint)
            .cloned()
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub async fn wait_for_calls(&self, endpoint: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.calls_to(endpoint).len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("expected request never arrived");
    }

    fn endpoint_for(url: &Url) -> Option<&'static str> {
        [LOGIN, CALLBACK, REFRESH, LOGOUT]
            .into_iter()
            .find(|e| url.path().ends_with(e))
    }
}

#[async_trait::async_trait]
impl Middleware for MockAuthServer {
    async fn handle(
        &self,
        req: Request,
        _: &mut http::Extensions,
        _: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let endpoint = Self::endpoint_for(req.url()).expect("request to an unknown endpoint");
        let body = req
            .body()
            .and_then(|b| b.as_bytes())
            .map(|b| serde_json::from_slice(b).expect("request body is JSON"))
            .unwrap_or(Value::Null);
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .map(|v| v.to_str().expect("ASCII header").to_owned());

        self.calls.lock().unwrap().push(RecordedCall {
            path: endpoint.to_owned(),
            body,
            authorization,
        });

        let gate = self.gates.lock().unwrap().get(endpoint).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .unwrap_or(Reply::Text(StatusCode::NOT_FOUND, "no reply configured"));

        let (status, body) = match reply {
            Reply::Json(status, body) => (status, body.to_string()),
            Reply::Text(status, body) => (status, body.to_owned()),
            Reply::TransportError => {
                return Err(reqwest_middleware::Error::middleware(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))
            }
        };

        let resp = http::Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap();
        Ok(resp.into())
    }
}
