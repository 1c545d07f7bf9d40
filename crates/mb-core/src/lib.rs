//! mb-core: state mirror, downstream envelope, and bus abstraction shared by
//! the telemetry services.

pub mod bus;
pub mod envelope;
pub mod mirror;
pub mod normalize;
pub mod publisher;

pub use bus::{Bus, BusError, RedisBus};
pub use envelope::{DeviceField, Envelope, EventRecord, EventStyle};
pub use mirror::Mirror;
pub use publisher::run_publisher;
