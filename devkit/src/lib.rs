/*!
# FleetWatch DevKit - test doubles and helpers for the kernel

- `MockBus`: broker-free bus, records publishes and feeds the ingest queue
- `FleetMessageBuilder`: topics and payloads shaped like real machine traffic
- `TestHarness`: store + fan-out + gateway wired around the mock bus
*/

pub mod contract_helpers;
pub mod mqtt_stub;
pub mod test_utils;

pub use contract_helpers::FleetMessageBuilder;
pub use mqtt_stub::{MockBus, MockMessage};
pub use test_utils::{init_tracing, TestClient, TestHarness};
