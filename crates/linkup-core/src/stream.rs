use crate::errors::GatewayError;

/// Events emitted while streaming a generation reply. Ordering contract:
///
/// Start → Delta* → (Done | Error)
///
/// `Done` carries the full accumulated text so consumers never have to
/// re-concatenate deltas themselves.
#[derive(Clone, Debug)]
pub enum TokenEvent {
    Start,
    Delta { delta: String },
    Done { text: String },
    Error { error: GatewayError },
}

impl TokenEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
