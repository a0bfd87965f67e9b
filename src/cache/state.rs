use crate::error::FailureKind;

/// Identifies one dispatch of an (id, kind).
///
/// `epoch` changes on every full reset; `seq` is unique within the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub epoch: u64,
    pub seq: u64,
}

/// Per (id, kind) load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Absent,
    /// An attempt is running.
    InFlight { ticket: Ticket, attempt: u32 },
    /// Waiting on a retry timer before `attempt + 1`.
    Backoff { ticket: Ticket, attempt: u32 },
    Loaded,
    Failed { attempts: u32, reason: FailureKind },
}

impl LoadState {
    /// True while a dispatch owns this slot.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::InFlight { .. } | Self::Backoff { .. })
    }

    pub fn ticket(&self) -> Option<Ticket> {
        match self {
            Self::InFlight { ticket, .. } | Self::Backoff { ticket, .. } => Some(*ticket),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl Default for LoadState {
    fn default() -> Self {
        Self::Absent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_states_carry_ticket() {
        let ticket = Ticket { epoch: 1, seq: 7 };
        assert_eq!(LoadState::InFlight { ticket, attempt: 1 }.ticket(), Some(ticket));
        assert!(LoadState::Backoff { ticket, attempt: 2 }.is_pending());
        assert_eq!(LoadState::Loaded.ticket(), None);
        assert!(!LoadState::Absent.is_pending());
    }
}
