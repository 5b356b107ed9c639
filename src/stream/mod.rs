//! Streaming transport and wire event parsing
//!
//! Bytes from one HTTP response flow through `FrameDecoder` (SSE framing),
//! `envelope::parse` (legacy and flat encodings into `WireEvent`) and
//! `StreamContext` (per-stream dispatch with the terminal guard) before
//! reaching the caller through a `StreamHandle`.

mod decoder;
mod dispatcher;
mod envelope;
mod handle;
mod transport;

pub use decoder::FrameDecoder;
pub use dispatcher::{StreamContext, ENDED_EARLY, RUN_FAILED};
pub use envelope::{parse as parse_envelope, WireEvent};
pub use handle::{CancelHandle, EventSender, StreamHandle};
pub use transport::{Endpoints, HttpTransport, Operation, Transport};
