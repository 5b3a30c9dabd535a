// =============================================================================
// Live stream — reconnect state machine and its websocket driver
// =============================================================================

pub mod connection;
pub mod machine;

pub use connection::{StreamConnection, StreamControl, StreamEvent, StreamHandle};
pub use machine::{reconnect_delay, Action, ConnectionMachine, ControlFrame};
