//! In-process stand-in for the analytics socket.
//!
//! The service runs on its own runtime so tests may drive the client from
//! blocking code as well as from async tests. Authentication succeeds only
//! for [`super::VALID_KEY`]; every other frame is recorded and handed to a
//! responder that scripts the replies.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio_tungstenite::tungstenite::Message;

use super::VALID_KEY;

/// What the service does in response to a request frame.
pub enum Reply {
    Frame(Value),
    /// Drop the socket without a close frame.
    Disconnect,
}

/// Context handed to the responder for each request.
pub struct Request<'a> {
    pub frame: &'a Value,
    /// 1-based index of this request among all received with the same method.
    pub nth_of_method: usize,
}

type Responder = dyn Fn(Request<'_>) -> Vec<Reply> + Send + Sync;

pub struct MockService {
    runtime: Option<Runtime>,
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
}

impl MockService {
    pub fn start<F>(responder: F) -> Self
    where
        F: Fn(Request<'_>) -> Vec<Reply> + Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("mock runtime starts");
        // Bound synchronously: `block_on` would panic inside an async test.
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("mock binds");
        std_listener
            .set_nonblocking(true)
            .expect("mock listener is non-blocking");
        let addr = std_listener.local_addr().expect("mock has an address");

        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let responder: Arc<Responder> = Arc::new(responder);

        let state = (Arc::clone(&received), Arc::clone(&connections));
        runtime.spawn(async move {
            let (received, connections) = state;
            let Ok(listener) = TcpListener::from_std(std_listener) else {
                return;
            };
            while let Ok((tcp, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    tcp,
                    Arc::clone(&received),
                    Arc::clone(&responder),
                ));
            }
        });

        Self {
            runtime: Some(runtime),
            addr,
            received,
            connections,
        }
    }

    /// Echo-style service: every request is answered with `data` for all
    /// fingerprints it lists.
    pub fn answering(data: Value) -> Self {
        Self::start(move |request| {
            vec![Reply::Frame(json!({
                "data": data.clone(),
                "cache_key": request.frame["cache_key"].clone(),
            }))]
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/api/", self.addr)
    }

    /// Request frames received so far, auth frames excluded.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().expect("received lock").clone()
    }

    pub fn received_for(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|frame| frame["api_method"] == method)
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn serve(
    tcp: tokio::net::TcpStream,
    received: Arc<Mutex<Vec<Value>>>,
    responder: Arc<Responder>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };

        if let Some(key) = frame.get("finx_api_key") {
            if key == VALID_KEY {
                let ack = json!({"is_authenticated": true}).to_string();
                if ws.send(Message::Text(ack.into())).await.is_err() {
                    return;
                }
            }
            continue;
        }

        let nth_of_method = {
            let mut received = received.lock().expect("received lock");
            received.push(frame.clone());
            received
                .iter()
                .filter(|f| f["api_method"] == frame["api_method"])
                .count()
        };

        for reply in responder(Request {
            frame: &frame,
            nth_of_method,
        }) {
            match reply {
                Reply::Frame(value) => {
                    if ws.send(Message::Text(value.to_string().into())).await.is_err() {
                        return;
                    }
                }
                Reply::Disconnect => return,
            }
        }
    }
}
