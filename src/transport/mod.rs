//! TCP frame streaming with start/stop flow control
//!
//! Frames travel server → viewer as raw fixed-size payloads with no header;
//! both ends derive the size from the configured geometry. Control bytes
//! (`1` start, `2` stop) travel viewer → server on the same connection.

pub mod control;
pub mod receiver;
pub mod sender;
pub mod session;

pub use control::{listen_for_commands, parse_commands, ControlCommand, StreamControl};
pub use receiver::FrameReceiver;
pub use sender::{FrameSender, SenderStats};
pub use session::{run_server, run_viewer, serve_session, OperatorInput};
