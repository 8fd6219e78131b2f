use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::error::{Error, Result};

/// Server-side state of a transaction.
///
/// A transaction starts in `Trying` when the request is received (or, for a
/// locally originated request, when it is created). A provisional response
/// sent upstream moves it to `Proceeding`, the final response to
/// `Completed`, and the wait timer to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        *self == TransactionState::Terminated
    }

    /// Whether moving from `self` to `next` is allowed. States only move
    /// forward; `Proceeding -> Proceeding` (another provisional) is fine.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        match (self, next) {
            (Trying, Proceeding | Completed | Terminated) => true,
            (Proceeding, Proceeding | Completed | Terminated) => true,
            (Completed, Terminated) => true,
            _ => false,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TransactionState::Trying => 0,
            TransactionState::Proceeding => 1,
            TransactionState::Completed => 2,
            TransactionState::Terminated => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Trying,
            1 => TransactionState::Proceeding,
            2 => TransactionState::Completed,
            // unknown values read as terminated
            _ => TransactionState::Terminated,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Lock-free mirror of the state, readable without the reply lock (table
/// matching, admin snapshots). Writes happen under the reply lock.
#[derive(Debug)]
pub struct AtomicTransactionState {
    value: AtomicU8,
}

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        Self {
            value: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self) -> TransactionState {
        TransactionState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Move to `next`, validating the transition. Re-entering the current
    /// state is accepted as a no-op.
    pub fn transition(&self, next: TransactionState) -> Result<TransactionState> {
        let current = self.get();
        if current == next {
            return Ok(current);
        }
        if !current.can_transition_to(next) {
            return Err(Error::InvalidStateTransition(format!("{} -> {}", current, next)));
        }
        self.value.store(next.as_u8(), Ordering::Release);
        Ok(current)
    }

    /// Unconditional termination; returns the previous state.
    pub fn terminate(&self) -> TransactionState {
        TransactionState::from_u8(self.value.swap(TransactionState::Terminated.as_u8(), Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_only() {
        let state = AtomicTransactionState::new(TransactionState::Trying);
        assert_eq!(state.transition(TransactionState::Proceeding).unwrap(), TransactionState::Trying);
        assert!(state.transition(TransactionState::Proceeding).is_ok());
        state.transition(TransactionState::Completed).unwrap();
        assert!(matches!(
            state.transition(TransactionState::Proceeding),
            Err(Error::InvalidStateTransition(_))
        ));
        assert_eq!(state.get(), TransactionState::Completed);
        assert_eq!(state.terminate(), TransactionState::Completed);
        assert!(state.get().is_terminated());
    }

    #[test]
    fn trying_may_complete_directly() {
        assert!(TransactionState::Trying.can_transition_to(TransactionState::Completed));
        assert!(!TransactionState::Terminated.can_transition_to(TransactionState::Trying));
    }
}
