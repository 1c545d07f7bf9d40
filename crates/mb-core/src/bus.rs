//! Downstream pub/sub bus.
//!
//! Only one operation is needed: `publish(channel, payload)`.  The trait
//! exists so tests can capture payloads in memory; production uses Redis
//! through a [`redis::aio::ConnectionManager`], which reconnects on its own.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

pub trait Bus: Send + 'static {
    fn publish(
        &mut self,
        channel: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// Redis-backed bus client.
#[derive(Clone)]
pub struct RedisBus {
    manager: ConnectionManager,
}

impl RedisBus {
    /// Connect to `redis://host:port/db`.
    pub async fn connect(host: &str, port: u16, db: u32) -> Result<RedisBus, BusError> {
        let client = redis::Client::open(format!("redis://{host}:{port}/{db}"))?;
        let manager = client.get_connection_manager().await?;
        Ok(RedisBus { manager })
    }
}

impl Bus for RedisBus {
    async fn publish(&mut self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let _: () = self.manager.publish(channel, payload).await?;
        Ok(())
    }
}
