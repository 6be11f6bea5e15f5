//! Per-connection session handling
//!
//! Everything here is owned by one connection's handling loop. The only
//! state shared across connections is the detector and the dispatcher.

mod gate;
mod guard;
mod messages;
mod protocol;
mod queue;
mod utterance;
mod wake;

pub use gate::{Activation, ActivationGate};
pub use guard::ProcessingGuard;
pub use messages::{ClientEnvelope, ClientMessage, ServerMessage};
pub use protocol::{Action, Input, Session, SessionProtocol, SessionState};
pub use queue::{Inbound, InboundQueue, Pushed};
pub use utterance::{CaptureStatus, EndReason, UtteranceCapture};
pub use wake::WakeWordListener;
