/*!
# libridge devkit - mocks and helpers for bridge tests

- `MockBroker`: in-memory `BrokerTransport`, records subscriptions and
  publishes, lets tests inject CONNACKs and inbound messages
- `MockMultiplexer`: in-memory `LineMultiplexer`, records serial writes and
  lets tests emit node lines
- `TestHarness`: a `BridgeSession` wired to both mocks
*/

pub mod mqtt_stub;
pub mod serial_stub;
pub mod test_utils;

pub use mqtt_stub::{MockBroker, MockMessage};
pub use serial_stub::{MockMultiplexer, SentCommand};
pub use test_utils::{init_tracing, wait_until, TestHarness};
