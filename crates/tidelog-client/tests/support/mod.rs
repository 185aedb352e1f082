//! In-memory fake server for driving the duplex channel in tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use tidelog_client::{ClientConfig, Connection};
use tidelog_common::Value;
use tidelog_protocol::{codec, Envelope, EnvelopeCodec, EnvelopeKind};

/// What the fake server does with one inbound request.
pub enum ServerAction {
    /// Answer with these response parameters
    Reply(HashMap<String, Value>),
    /// Answer with an RPC error
    Error { code: String, message: String },
    /// Never answer (lets callers exercise timeouts)
    Ignore,
}

pub type Handler =
    Arc<dyn Fn(Envelope, UnboundedSender<Envelope>) -> BoxFuture<'static, ServerAction> + Send + Sync>;

pub struct ServerHandle {
    /// Push any envelope (usually a trap) to the client
    pub push: UnboundedSender<Envelope>,
    pub task: JoinHandle<()>,
}

/// Spawn a fake server over the far half of a duplex stream.
///
/// Requests go through `handler` (which also receives the push sender, so
/// a reply can be accompanied by traps); non-request envelopes such as
/// keepalive pings are ignored.
pub fn serve(io: DuplexStream, handler: Handler) -> ServerHandle {
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Envelope>();
    let push = push_tx.clone();

    let task = tokio::spawn(async move {
        let mut framed = Framed::new(io, EnvelopeCodec::new());
        loop {
            tokio::select! {
                Some(env) = push_rx.recv() => {
                    if framed.send(codec::encode(&env)).await.is_err() {
                        break;
                    }
                }
                frame = framed.next() => match frame {
                    Some(Ok(text)) => {
                        let env = match codec::decode(&text) {
                            Ok(env) => env,
                            Err(_) => continue,
                        };
                        if env.kind != EnvelopeKind::Request {
                            continue;
                        }
                        let reply_template = Envelope::response_to(&env);
                        match handler(env, push_tx.clone()).await {
                            ServerAction::Reply(params) => {
                                let mut resp = reply_template;
                                resp.params = params;
                                if framed.send(codec::encode(&resp)).await.is_err() {
                                    break;
                                }
                            }
                            ServerAction::Error { code, message } => {
                                let mut resp = reply_template;
                                resp.error_code = Some(code);
                                resp.error_message = Some(message);
                                if framed.send(codec::encode(&resp)).await.is_err() {
                                    break;
                                }
                            }
                            ServerAction::Ignore => {}
                        }
                    }
                    _ => break,
                }
            }
        }
    });

    ServerHandle { push, task }
}

/// Connection + far-side stream pair over an in-memory duplex.
pub fn connection_pair(config: &ClientConfig) -> (Arc<Connection>, DuplexStream) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    (Connection::start(client_io, config), server_io)
}

/// Response parameters for a successful login.
pub fn login_ok() -> HashMap<String, Value> {
    let mut params = HashMap::new();
    params.insert("session".to_string(), Value::from("sess-1"));
    params
}

pub fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
