//! The protocol link: two-phase session establishment and request/reply.
//!
//! # Session establishment
//! 1. **Authenticate** (control port, cleartext): read the greeting, check
//!    the requested machine is advertised, choose a session key, send the
//!    `connect` request, read back the data port.
//! 2. **Data session** (data port): every byte is XOR-obfuscated with the
//!    session key from the first byte sent.  A hello carrying the client
//!    name is answered with the machine's info map (e.g. `refresh-period`).
//!
//! # Request/reply
//! `next_id` strictly increases per connection; after a request, the next
//! received message on the socket is its reply.  Zero or more than one
//! complete frame inside a reply window is a protocol error.  A reply with
//! a truthy `ret` raises [`LinkError::Remote`].
//!
//! A receive timeout is a first-class signal ([`Received::Timeout`]), not an
//! error: callers use it to drive liveness probes.  An empty read means the
//! peer closed.

use mb_protocol::{FieldMap, FrameBuffer, Message, ProtocolError, Value, XorKey};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Read deadline for handshake and request replies.
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Fields read once after connecting, beyond the status snapshot.
pub const EXTRA_FIELDS: [&str; 8] = [
    "@statistics",
    "prj-name",
    "step-data",
    "work-selectors",
    "glass-id",
    "glass-type",
    "h-glass",
    "cut-recipe",
];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] ProtocolError),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("machine {requested} is not available (offered: {offered})")]
    MachineUnavailable { requested: String, offered: String },
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("data-port connect refused: {0}")]
    ConnectFailed(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("status change subscription not supported")]
    SubscribeUnsupported,
    #[error("no reply within {0:?}")]
    ReplyTimeout(Duration),
    #[error("connection closed by the control server")]
    Closed,
}

/// Outcome of a blocking receive with a deadline.
#[derive(Debug)]
pub enum Received {
    Messages(Vec<Message>),
    /// No message arrived in the window.  Not an error.
    Timeout,
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Connection parameters for one machine endpoint.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub control_port: u16,
    pub machine: String,
    pub client_name: String,
}

/// An established, obfuscated data session.
#[derive(Debug)]
pub struct Link {
    stream: TcpStream,
    key: XorKey,
    frames: FrameBuffer,
    next_id: i64,
    machine_info: FieldMap,
}

impl Link {
    /// Establish a session with a random session key.
    pub async fn establish(cfg: &LinkConfig) -> Result<Link, LinkError> {
        Link::establish_with_key(cfg, XorKey::random()).await
    }

    /// Establish a session with an explicit session key (fixed-key tests).
    pub async fn establish_with_key(cfg: &LinkConfig, key: XorKey) -> Result<Link, LinkError> {
        let data_port = authenticate(cfg, key).await?;
        debug!(port = data_port, "authenticated, reconnecting to data port");

        let stream = TcpStream::connect((cfg.host.as_str(), data_port)).await?;
        let mut link = Link {
            stream,
            key,
            frames: FrameBuffer::new(),
            next_id: 1,
            machine_info: FieldMap::new(),
        };

        let mut body = FieldMap::new();
        body.insert("sender".to_owned(), Value::Str(cfg.client_name.clone()));
        let hello = Message::with_header([("id", Value::Int(1))]).with_body(body);
        link.send(&hello).await?;
        let reply = link.receive_one().await?;
        if reply.is_error() {
            return Err(LinkError::ConnectFailed(reply.error_text()));
        }
        link.machine_info = reply.body;
        info!(machine = %cfg.machine, "data session established");
        Ok(link)
    }

    /// The info map the server returned at connect time.
    pub fn machine_info(&self) -> &FieldMap {
        &self.machine_info
    }

    /// Read the given fields; the reply body is the answer map.
    pub async fn read(&mut self, fields: &[&str]) -> Result<FieldMap, LinkError> {
        let body = fields
            .iter()
            .map(|f| ((*f).to_owned(), Value::Null))
            .collect();
        let reply = self.request(body).await?;
        Ok(reply.body)
    }

    /// Read the `$status` snapshot.
    pub async fn read_status(&mut self) -> Result<FieldMap, LinkError> {
        self.read(&["$status"]).await
    }

    /// Assign the given fields; the reply acknowledges.
    pub async fn write(&mut self, fields: FieldMap) -> Result<(), LinkError> {
        self.request(fields).await?;
        Ok(())
    }

    /// Fire-and-forget notification; no id correlation, no reply consumed.
    pub async fn notify(&mut self, fields: FieldMap) -> Result<(), LinkError> {
        let msg = Message::with_header([("msg", Value::Str("notify".to_owned()))])
            .with_body(fields);
        self.send(&msg).await
    }

    /// Subscribe to asynchronous `$status` change pushes.  An empty reply
    /// body means the server does not support the subscription.
    pub async fn subscribe_to_status_changes(&mut self) -> Result<FieldMap, LinkError> {
        let mut body = FieldMap::new();
        body.insert("$subscribed".to_owned(), Value::Str("$status".to_owned()));
        let reply = self.request(body).await?;
        if reply.body.is_empty() {
            return Err(LinkError::SubscribeUnsupported);
        }
        Ok(reply.body)
    }

    /// Receive every message available within `window`.  A timeout is a
    /// normal outcome; an empty read raises [`LinkError::Closed`].
    pub async fn receive_all(&mut self, window: Duration) -> Result<Received, LinkError> {
        loop {
            let msgs = self.frames.drain_messages()?;
            if !msgs.is_empty() {
                return Ok(Received::Messages(msgs));
            }
            let mut chunk = [0u8; 4096];
            let n = match timeout(window, self.stream.read(&mut chunk)).await {
                Err(_) => return Ok(Received::Timeout),
                Ok(res) => res?,
            };
            if n == 0 {
                return Err(LinkError::Closed);
            }
            self.key.apply(&mut chunk[..n]);
            self.frames.extend(&chunk[..n]);
        }
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn request(&mut self, body: FieldMap) -> Result<Message, LinkError> {
        self.next_id += 1;
        let msg = Message::with_header([("id", Value::Int(self.next_id))]).with_body(body);
        self.send(&msg).await?;
        let reply = self.receive_one().await?;
        if reply.is_error() {
            return Err(LinkError::Remote(reply.error_text()));
        }
        Ok(reply)
    }

    async fn send(&mut self, msg: &Message) -> Result<(), LinkError> {
        let mut payload = msg.encode();
        self.key.apply(&mut payload);
        self.stream.write_all(&payload).await?;
        Ok(())
    }

    async fn receive_one(&mut self) -> Result<Message, LinkError> {
        receive_one(&mut self.stream, &mut self.frames, Some(self.key)).await
    }
}

// ---------------------------------------------------------------------------
// Phase A: authentication on the control port
// ---------------------------------------------------------------------------

/// Run the cleartext authentication exchange; returns the data port.
async fn authenticate(cfg: &LinkConfig, key: XorKey) -> Result<u16, LinkError> {
    let mut stream = TcpStream::connect((cfg.host.as_str(), cfg.control_port)).await?;
    let mut frames = FrameBuffer::new();

    let greet = receive_one(&mut stream, &mut frames, None).await?;
    let offered = greet.body.get("machines");
    if !machine_offered(offered, &cfg.machine) {
        return Err(LinkError::MachineUnavailable {
            requested: cfg.machine.clone(),
            offered: offered.map(describe_machines).unwrap_or_default(),
        });
    }
    let greet_id = greet
        .id()
        .ok_or_else(|| LinkError::Protocol("greeting carries no id".to_owned()))?;

    let mut body = FieldMap::new();
    body.insert("sender".to_owned(), Value::Str(cfg.client_name.clone()));
    body.insert("machine".to_owned(), Value::Str(cfg.machine.clone()));
    body.insert("auth-lvl".to_owned(), Value::Int(0));
    body.insert("auth-key".to_owned(), Value::Int(i64::from(key.value())));
    let connect = Message::with_header([
        ("id", Value::Int(1)),
        ("rep-to", Value::Int(greet_id)),
        ("msg", Value::Str("connect".to_owned())),
    ])
    .with_body(body);
    stream.write_all(&connect.encode()).await?;

    let reply = receive_one(&mut stream, &mut frames, None).await?;
    if reply.is_error() {
        return Err(LinkError::AuthFailed(reply.error_text()));
    }
    reply
        .body
        .get("port")
        .and_then(Value::as_int)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| LinkError::Protocol("authentication reply carries no port".to_owned()))
}

/// The greeting advertises machines as a list, or as a bare name when only
/// one is accepted.
fn machine_offered(offered: Option<&Value>, name: &str) -> bool {
    match offered {
        Some(Value::StrList(machines)) => machines.iter().any(|m| m == name),
        Some(Value::Str(machine)) => machine == name,
        _ => false,
    }
}

fn describe_machines(offered: &Value) -> String {
    match offered {
        Value::StrList(machines) => machines.join(", "),
        Value::Str(machine) => machine.clone(),
        other => format!("{other:?}"),
    }
}

/// Read until exactly one complete frame is available.  More than one frame
/// inside a single reply window breaks the request/reply contract.
async fn receive_one(
    stream: &mut TcpStream,
    frames: &mut FrameBuffer,
    key: Option<XorKey>,
) -> Result<Message, LinkError> {
    loop {
        let mut msgs = frames.drain_messages()?;
        match msgs.len() {
            0 => {}
            1 => return Ok(msgs.remove(0)),
            n => {
                return Err(LinkError::Protocol(format!(
                    "{n} messages inside one reply window"
                )));
            }
        }
        let mut chunk = [0u8; 4096];
        let n = match timeout(REPLY_TIMEOUT, stream.read(&mut chunk)).await {
            Err(_) => return Err(LinkError::ReplyTimeout(REPLY_TIMEOUT)),
            Ok(res) => res?,
        };
        if n == 0 {
            return Err(LinkError::Closed);
        }
        if let Some(key) = key {
            key.apply(&mut chunk[..n]);
        }
        frames.extend(&chunk[..n]);
    }
}
