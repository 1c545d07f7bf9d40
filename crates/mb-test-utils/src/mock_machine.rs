//! A mock control server speaking the framed wire protocol, for integration
//! testing the monitor service.
//!
//! Binds two listeners on random ports: a control port that greets, checks
//! the requested machine, and hands out the data port; and a data port that
//! XORs every byte with the key the client chose during authentication.
//!
//! # Protocol behavior
//!
//! - Control: send the greeting (`machines`, `auth-key`), read the `connect`
//!   request, record its `auth-key` as the session key, reply with the data
//!   port.  An unknown machine gets a `ret` error reply.
//! - Data: the first message is the hello; it is answered with the fixture's
//!   `refresh-period` and counts as an established session.  Afterwards:
//!   `$subscribed` requests are acknowledged, `$status` reads answered from
//!   the fixture's status map, other all-null reads answered from the
//!   fixture's extra map, writes acked with an empty reply, and `notify`
//!   messages consumed silently.
//! - `push_news` / `push_event` inject asynchronous frames into the current
//!   data connection; `drop_data_link` closes it from the server side.

use mb_protocol::{FieldMap, FrameBuffer, Message, Value, XorKey};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Canned server behavior for one test.
#[derive(Debug, Clone)]
pub struct MachineFixture {
    pub machine: String,
    pub greet_id: i64,
    /// The server's public value in the greeting (ignored by clients).
    pub auth_key: i64,
    pub refresh_period: f64,
    /// Reply to `$status` reads.
    pub status: FieldMap,
    /// Reply pool for multi-field reads; requested keys absent from the
    /// pool are omitted from the reply.
    pub extra: FieldMap,
}

impl Default for MachineFixture {
    fn default() -> MachineFixture {
        let mut status = FieldMap::new();
        status.insert("generic-status".to_owned(), Value::Str("IDLE".to_owned()));
        MachineFixture {
            machine: "ActiveW".to_owned(),
            greet_id: 7,
            auth_key: 42,
            refresh_period: 0.3,
            status,
            extra: FieldMap::new(),
        }
    }
}

struct Shared {
    fixture: MachineFixture,
    /// Session key recorded from the most recent control handshake.
    key: Mutex<Option<XorKey>>,
    data_writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    sessions_tx: watch::Sender<usize>,
    subscribed_tx: watch::Sender<bool>,
}

pub struct MockMachine {
    control_addr: SocketAddr,
    shared: Arc<Shared>,
    sessions_rx: watch::Receiver<usize>,
    subscribed_rx: watch::Receiver<bool>,
    _control_task: tokio::task::JoinHandle<()>,
    _data_task: tokio::task::JoinHandle<()>,
}

impl MockMachine {
    pub async fn start(fixture: MachineFixture) -> std::io::Result<MockMachine> {
        let control = TcpListener::bind("127.0.0.1:0").await?;
        let data = TcpListener::bind("127.0.0.1:0").await?;
        let control_addr = control.local_addr()?;
        let data_port = data.local_addr()?.port();

        let (sessions_tx, sessions_rx) = watch::channel(0usize);
        let (subscribed_tx, subscribed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            fixture,
            key: Mutex::new(None),
            data_writer: tokio::sync::Mutex::new(None),
            sessions_tx,
            subscribed_tx,
        });

        let control_task = tokio::spawn(control_loop(control, shared.clone(), data_port));
        let data_task = tokio::spawn(data_loop(data, shared.clone()));

        Ok(MockMachine {
            control_addr,
            shared,
            sessions_rx,
            subscribed_rx,
            _control_task: control_task,
            _data_task: data_task,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Sessions established so far (data-port hellos answered).
    pub fn sessions(&self) -> usize {
        *self.sessions_rx.borrow()
    }

    /// Wait until at least `n` sessions have been established.
    pub async fn wait_for_sessions(&self, n: usize) {
        let mut rx = self.sessions_rx.clone();
        while *rx.borrow() < n {
            rx.changed().await.expect("mock machine stopped");
        }
    }

    /// Wait for a `$subscribed` request on the current session.
    pub async fn wait_for_subscription(&self) {
        let mut rx = self.subscribed_rx.clone();
        while !*rx.borrow() {
            rx.changed().await.expect("mock machine stopped");
        }
    }

    /// Push a `news` frame with the given fields.
    pub async fn push_news(&self, fields: FieldMap) {
        let msg =
            Message::with_header([("msg", Value::Str("news".to_owned()))]).with_body(fields);
        self.push(msg).await;
    }

    /// Push an `event` frame with the given fields (including `event`).
    pub async fn push_event(&self, fields: FieldMap) {
        let msg =
            Message::with_header([("msg", Value::Str("event".to_owned()))]).with_body(fields);
        self.push(msg).await;
    }

    /// Close the current data connection from the server side.
    pub async fn drop_data_link(&self) {
        let mut slot = self.shared.data_writer.lock().await;
        if let Some(mut writer) = slot.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn push(&self, msg: Message) {
        let key = self
            .shared
            .key
            .lock()
            .expect("key lock")
            .expect("no session key negotiated yet");
        let mut payload = msg.encode();
        key.apply(&mut payload);
        let mut slot = self.shared.data_writer.lock().await;
        let writer = slot.as_mut().expect("no data connection");
        writer.write_all(&payload).await.expect("push to client");
    }
}

// ---------------------------------------------------------------------------
// Control port
// ---------------------------------------------------------------------------

async fn control_loop(listener: TcpListener, shared: Arc<Shared>, data_port: u16) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    // Handshake failures are expected in fault tests.
                    let _ = control_handshake(stream, shared, data_port).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn control_handshake(
    mut stream: TcpStream,
    shared: Arc<Shared>,
    data_port: u16,
) -> std::io::Result<()> {
    let fixture = &shared.fixture;

    let mut greet_body = FieldMap::new();
    greet_body.insert("machines".to_owned(), Value::Str(fixture.machine.clone()));
    greet_body.insert("auth-key".to_owned(), Value::Int(fixture.auth_key));
    let greet = Message::with_header([
        ("id", Value::Int(fixture.greet_id)),
        ("msg", Value::Str("greet".to_owned())),
    ])
    .with_body(greet_body);
    stream.write_all(&greet.encode()).await?;

    let connect = read_one(&mut stream, None).await?;
    let rep_to = connect.id().unwrap_or(0);

    let requested = connect.body.get("machine").and_then(Value::as_str);
    if requested != Some(fixture.machine.as_str()) {
        let nack = Message::with_header([
            ("id", Value::Int(2)),
            ("rep-to", Value::Int(rep_to)),
            ("ret", Value::Int(1)),
            ("msg", Value::Str("unknown machine".to_owned())),
        ]);
        stream.write_all(&nack.encode()).await?;
        return Ok(());
    }

    let chosen = connect
        .body
        .get("auth-key")
        .and_then(Value::as_int)
        .and_then(|k| u8::try_from(k).ok())
        .and_then(XorKey::new);
    *shared.key.lock().expect("key lock") = chosen;

    let mut reply_body = FieldMap::new();
    reply_body.insert("port".to_owned(), Value::Int(i64::from(data_port)));
    let reply = Message::with_header([("id", Value::Int(2)), ("rep-to", Value::Int(rep_to))])
        .with_body(reply_body);
    stream.write_all(&reply.encode()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Data port
// ---------------------------------------------------------------------------

async fn data_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let _ = data_session(stream, shared).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn data_session(stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let key = shared
        .key
        .lock()
        .expect("key lock")
        .expect("data connection before authentication");
    let (mut reader, writer) = stream.into_split();
    *shared.data_writer.lock().await = Some(writer);
    let _ = shared.subscribed_tx.send(false);

    let mut frames = FrameBuffer::new();
    let mut chunk = [0u8; 4096];
    let mut greeted = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        let mut bytes = chunk[..n].to_vec();
        key.apply(&mut bytes);
        frames.extend(&bytes);
        let msgs = frames
            .drain_messages()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        for msg in msgs {
            if let Some(reply) = handle_data_message(&shared, &msg, &mut greeted) {
                write_obfuscated(&shared, key, &reply).await?;
            }
        }
    }
}

fn handle_data_message(shared: &Shared, msg: &Message, greeted: &mut bool) -> Option<Message> {
    let fixture = &shared.fixture;
    let rep_to = msg.id().unwrap_or(0);
    let reply_header = move || {
        Message::with_header([("id", Value::Int(100)), ("rep-to", Value::Int(rep_to))])
    };

    if !*greeted {
        *greeted = true;
        let mut body = FieldMap::new();
        body.insert(
            "refresh-period".to_owned(),
            Value::Float(fixture.refresh_period),
        );
        let _ = shared.sessions_tx.send_modify(|n| *n += 1);
        return Some(reply_header().with_body(body));
    }

    if msg.verb() == Some("notify") {
        return None;
    }
    if msg.body.contains_key("$subscribed") {
        let _ = shared.subscribed_tx.send(true);
        let mut body = FieldMap::new();
        body.insert("$subscribed".to_owned(), Value::Str("$status".to_owned()));
        return Some(reply_header().with_body(body));
    }
    if msg.body.contains_key("$status") {
        return Some(reply_header().with_body(fixture.status.clone()));
    }
    let is_read = !msg.body.is_empty() && msg.body.values().all(|v| *v == Value::Null);
    if is_read {
        let mut body = FieldMap::new();
        for key in msg.body.keys() {
            if let Some(val) = fixture.extra.get(key) {
                body.insert(key.clone(), val.clone());
            }
        }
        return Some(reply_header().with_body(body));
    }
    // A write: acknowledge with a bare reply.
    Some(reply_header())
}

async fn write_obfuscated(
    shared: &Shared,
    key: XorKey,
    msg: &Message,
) -> std::io::Result<()> {
    let mut payload = msg.encode();
    key.apply(&mut payload);
    let mut slot = shared.data_writer.lock().await;
    match slot.as_mut() {
        Some(writer) => writer.write_all(&payload).await,
        // The test dropped the link; nothing to reply to.
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Cleartext read helper (control port)
// ---------------------------------------------------------------------------

async fn read_one(stream: &mut TcpStream, key: Option<XorKey>) -> std::io::Result<Message> {
    let mut frames = FrameBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed during handshake",
            ));
        }
        let mut bytes = chunk[..n].to_vec();
        if let Some(key) = key {
            key.apply(&mut bytes);
        }
        frames.extend(&bytes);
        let mut msgs = frames
            .drain_messages()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(msg) = msgs.pop() {
            return Ok(msg);
        }
    }
}
