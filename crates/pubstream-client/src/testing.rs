//! Test utilities for pubstream-client
//!
//! [`StubBroker`] is a small in-process broker speaking the same HTTP
//! surface as the real one: `POST /publish`, `POST /{topic}`,
//! `GET /subscribe?topics=..` and `GET /{topic}`, streaming NDJSON or SSE
//! depending on the `Accept` header. [`ScriptedStream`] serves hand-written
//! byte chunks so framing can be exercised over a real connection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::{Authorization, HeaderMapExt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::streaming::WireFormat;
use crate::transport::ClientHandle;
use crate::types::{ConnectionCredential, Message, TlsVerification};
use crate::Result;

/// How a scripted stream finishes after its last chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptEnd {
    /// End the response body normally
    Close,
    /// Keep the connection open without sending anything
    HoldOpen,
    /// Fail the body so the connection is torn down mid-response
    Abort,
}

/// A canned response body delivered chunk by chunk
#[derive(Debug, Clone)]
pub struct ScriptedStream {
    chunks: Vec<Bytes>,
    interval: Duration,
    ending: ScriptEnd,
    format: WireFormat,
}

impl ScriptedStream {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            interval: Duration::from_millis(20),
            ending: ScriptEnd::Close,
            format: WireFormat::Ndjson,
        }
    }

    /// Pause between chunks, so they arrive as separate reads
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn then(mut self, ending: ScriptEnd) -> Self {
        self.ending = ending;
        self
    }

    /// Content type advertised for the body
    pub fn format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    fn into_body(self) -> Body {
        struct Cursor {
            chunks: VecDeque<Bytes>,
            interval: Duration,
            ending: ScriptEnd,
            first: bool,
            aborted: bool,
        }

        let cursor = Cursor {
            chunks: self.chunks.into(),
            interval: self.interval,
            ending: self.ending,
            first: true,
            aborted: false,
        };

        let chunks = stream::unfold(cursor, |mut cursor| async move {
            if let Some(chunk) = cursor.chunks.pop_front() {
                if !cursor.first {
                    tokio::time::sleep(cursor.interval).await;
                }
                cursor.first = false;
                return Some((Ok(chunk), cursor));
            }

            match cursor.ending {
                ScriptEnd::Close => None,
                ScriptEnd::HoldOpen => {
                    std::future::pending::<()>().await;
                    None
                }
                ScriptEnd::Abort if !cursor.aborted => {
                    cursor.aborted = true;
                    tokio::time::sleep(cursor.interval).await;
                    let err = io::Error::new(io::ErrorKind::ConnectionReset, "scripted abort");
                    Some((Err(err), cursor))
                }
                ScriptEnd::Abort => None,
            }
        });

        Body::from_stream(chunks)
    }
}

/// Message as the broker puts it on the wire
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireMessage<'a> {
    id: &'a str,
    topic: &'a str,
    payload: &'a str,
    timestamp: i64,
}

fn wire_json(message: &Message) -> String {
    let wire = WireMessage {
        id: &message.id,
        topic: &message.topic,
        payload: &message.payload,
        timestamp: message.timestamp,
    };
    serde_json::to_string(&wire).unwrap_or_default()
}

#[derive(Deserialize)]
struct PublishBody {
    #[serde(alias = "Topic")]
    topic: String,
    #[serde(default, alias = "Payload")]
    payload: Option<String>,
    #[serde(default, alias = "Id")]
    id: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct DescriptionBody {
    #[serde(alias = "Description")]
    description: String,
}

#[derive(Deserialize)]
struct TopicsQuery {
    topics: String,
}

struct BrokerState {
    sender: broadcast::Sender<Message>,
    credentials: Option<(String, String)>,
    published: Mutex<Vec<Message>>,
    scripts: Mutex<HashMap<String, ScriptedStream>>,
    /// Fired to end every live stream gracefully
    closing: Mutex<CancellationToken>,
    exclusive_subscriptions: AtomicUsize,
}

type SharedState = Arc<BrokerState>;

impl BrokerState {
    fn authorize(&self, headers: &HeaderMap) -> std::result::Result<(), Response> {
        let Some((username, password)) = &self.credentials else {
            return Ok(());
        };

        match headers.typed_get::<Authorization<Basic>>() {
            Some(auth) if auth.username() == username && auth.password() == password => Ok(()),
            _ => Err((StatusCode::UNAUTHORIZED, "unauthorized").into_response()),
        }
    }

    fn accept(&self, message: Message) -> String {
        let id = message.id.clone();
        self.published.lock().push(message.clone());
        // No receivers is fine: nobody is subscribed yet
        let _ = self.sender.send(message);
        id
    }
}

/// In-process broker for tests that shuts down when dropped
pub struct StubBroker {
    pub addr: SocketAddr,
    state: SharedState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl StubBroker {
    /// Start a broker that accepts any caller
    pub async fn start() -> Result<Self> {
        Self::start_with_state(None).await
    }

    /// Start a broker that requires these basic credentials
    pub async fn start_with_credentials(username: &str, password: &str) -> Result<Self> {
        Self::start_with_state(Some((username.to_string(), password.to_string()))).await
    }

    async fn start_with_state(credentials: Option<(String, String)>) -> Result<Self> {
        let (sender, _) = broadcast::channel(256);
        let state = Arc::new(BrokerState {
            sender,
            credentials,
            published: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            closing: Mutex::new(CancellationToken::new()),
            exclusive_subscriptions: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route("/publish", post(publish))
            .route("/subscribe", get(subscribe_topics))
            .route("/scripts/{name}", get(scripted))
            .route("/{topic}", get(subscribe_topic).post(publish_topic))
            .with_state(state.clone());

        // Bind to any available port
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // Give server a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Get the base URL of the broker
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Handle carrying the broker's credentials (or a placeholder if it has none)
    pub fn handle(&self) -> Result<ClientHandle> {
        let credential = match &self.state.credentials {
            Some((username, password)) => ConnectionCredential::basic(username, password),
            None => ConnectionCredential::basic("guest", "guest"),
        };
        self.handle_with(credential)
    }

    /// Handle with an arbitrary credential
    pub fn handle_with(&self, credential: ConnectionCredential) -> Result<ClientHandle> {
        ClientHandle::configure(credential, &self.base_url(), TlsVerification::Enabled)
    }

    /// Every message accepted so far, in arrival order
    pub fn published(&self) -> Vec<Message> {
        self.state.published.lock().clone()
    }

    /// Number of live (non-scripted) streams
    pub fn subscriber_count(&self) -> usize {
        self.state.sender.receiver_count()
    }

    /// Streams opened with `x-exclusive: true`
    pub fn exclusive_subscriptions(&self) -> usize {
        self.state.exclusive_subscriptions.load(Ordering::SeqCst)
    }

    /// Push a message to live streams without going through HTTP
    pub fn inject(&self, message: Message) {
        self.state.accept(message);
    }

    /// Register a scripted stream and return its path relative to the base URL
    pub fn script(&self, name: &str, script: ScriptedStream) -> String {
        self.state.scripts.lock().insert(name.to_string(), script);
        format!("scripts/{}", name)
    }

    /// End every live stream gracefully; later subscriptions work normally
    pub fn close_streams(&self) {
        let mut closing = self.state.closing.lock();
        closing.cancel();
        *closing = CancellationToken::new();
    }

    /// Shutdown the broker, ending live streams first
    pub async fn shutdown(mut self) {
        self.close_streams();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for StubBroker {
    fn drop(&mut self) {
        self.state.closing.lock().cancel();
        // Send shutdown signal if not already done
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Abort the task if still running
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn publish(State(state): State<SharedState>, headers: HeaderMap, body: String) -> Response {
    if let Err(denied) = state.authorize(&headers) {
        return denied;
    }

    let request: PublishBody = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let mut message = Message::new(request.topic, request.payload.unwrap_or_default());
    match request.id {
        Some(serde_json::Value::String(id)) => message.id = id,
        Some(serde_json::Value::Number(id)) => message.id = id.to_string(),
        _ => {}
    }

    let id = state.accept(message);
    (StatusCode::ACCEPTED, Json(id)).into_response()
}

async fn publish_topic(
    State(state): State<SharedState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(denied) = state.authorize(&headers) {
        return denied;
    }

    let payload = match serde_json::from_str::<DescriptionBody>(&body) {
        Ok(parsed) => parsed.description,
        Err(_) => body,
    };

    let id = state.accept(Message::new(topic, payload));
    (StatusCode::ACCEPTED, Json(id)).into_response()
}

async fn subscribe_topics(
    State(state): State<SharedState>,
    Query(query): Query<TopicsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = state.authorize(&headers) {
        return denied;
    }

    let topics = query
        .topics
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    live_stream(&state, topics, &headers)
}

async fn subscribe_topic(
    State(state): State<SharedState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = state.authorize(&headers) {
        return denied;
    }

    live_stream(&state, HashSet::from([topic]), &headers)
}

async fn scripted(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = state.authorize(&headers) {
        return denied;
    }

    let Some(script) = state.scripts.lock().get(&name).cloned() else {
        return (StatusCode::NOT_FOUND, format!("no script named {}", name)).into_response();
    };

    let content_type = script.format.accept();
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        script.into_body(),
    )
        .into_response()
}

fn requested_format(headers: &HeaderMap) -> WireFormat {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if accept.contains(WireFormat::Sse.accept()) {
        WireFormat::Sse
    } else {
        WireFormat::Ndjson
    }
}

fn live_stream(state: &BrokerState, topics: HashSet<String>, headers: &HeaderMap) -> Response {
    let exclusive = headers
        .get("x-exclusive")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if exclusive {
        state.exclusive_subscriptions.fetch_add(1, Ordering::SeqCst);
    }

    // Subscribe before answering so nothing published after the headers is missed
    let receiver = state.sender.subscribe();
    let closing = state.closing.lock().clone();

    let messages = BroadcastStream::new(receiver)
        .filter_map(move |item| {
            let keep = match item {
                Ok(message) if topics.contains(&message.topic) => Some(message),
                _ => None,
            };
            futures::future::ready(keep)
        })
        .take_until(closing.cancelled_owned());

    match requested_format(headers) {
        WireFormat::Ndjson => {
            let lines = messages
                .map(|message| Ok::<_, Infallible>(Bytes::from(format!("{}\n", wire_json(&message)))));
            (
                [
                    (header::CONTENT_TYPE, WireFormat::Ndjson.accept()),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(lines),
            )
                .into_response()
        }
        WireFormat::Sse => {
            let events =
                messages.map(|message| Ok::<_, Infallible>(Event::default().data(wire_json(&message))));
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}
