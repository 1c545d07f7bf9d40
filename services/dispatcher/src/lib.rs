//! dispatcher: stateless line-delimited-JSON TCP sink.
//!
//! Each newline-terminated `{timestamp, event, args:{…}}` record is
//! normalized into a downstream envelope (timestamp converted to UTC
//! milliseconds, `event` first in `deviceData`, args normalized) and
//! published to the bus immediately.  No state is kept between lines.

use mb_core::{Bus, Envelope, EventRecord};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Dispatcher {
    listener: TcpListener,
}

impl Dispatcher {
    /// Bind the sink listener (use `"127.0.0.1:0"` to let the OS choose).
    pub async fn bind(addr: &str) -> std::io::Result<Dispatcher> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "sink listening");
        Ok(Dispatcher { listener })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    /// Accept sink connections until shutdown.
    pub async fn run<B: Bus + Clone>(
        self,
        bus: B,
        channel: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let channel: Arc<str> = channel.into();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "sink client connected");
                        tokio::spawn(serve_sink(stream, bus.clone(), channel.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        return;
                    }
                }
            }
        }
    }
}

/// Forward each record from one sink client as its own envelope.
async fn serve_sink<B: Bus>(stream: TcpStream, mut bus: B, channel: Arc<str>) {
    let peer = stream.peer_addr().ok();
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<EventRecord>(line) {
                    Ok(record) => {
                        let envelope = Envelope::from_event_record(&record);
                        if let Err(e) = bus.publish(&channel, envelope.to_compact_json()).await {
                            warn!(error = %e, "bus publish failed, record dropped");
                        }
                    }
                    Err(e) => warn!(error = %e, line, "invalid json line"),
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    info!(peer = ?peer, "sink client disconnected");
}
