//! mb-test-utils: shared test doubles for the telemetry services.

pub mod memory_bus;
pub mod mock_machine;

pub use memory_bus::MemoryBus;
pub use mock_machine::{MachineFixture, MockMachine};
