use crate::model::ReservationStatus;
use crate::slot::SlotKey;

#[derive(Debug)]
pub enum EngineError {
    /// A live reservation already occupies the slot.
    SlotTaken {
        slot: SlotKey,
        status: ReservationStatus,
    },
    /// The hold being acted on expired, was released, or was replaced.
    StaleHold(SlotKey),
    NotFound(SlotKey),
    /// Status not allowed for a direct owner insertion.
    InvalidStatus(ReservationStatus),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Contention errors are expected under load and are not bugs.
    pub fn is_contention(&self) -> bool {
        matches!(self, EngineError::SlotTaken { .. } | EngineError::StaleHold(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotTaken { slot, status } => {
                write!(f, "slot {slot} is taken ({status})")
            }
            EngineError::StaleHold(slot) => write!(f, "hold on {slot} is no longer active"),
            EngineError::NotFound(slot) => write!(f, "no reservation for {slot}"),
            EngineError::InvalidStatus(status) => {
                write!(f, "status {status} cannot be inserted directly")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
