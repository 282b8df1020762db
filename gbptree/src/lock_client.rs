//! Lock client state word.
//!
//! A lock client is either active, preparing to commit, or stopped, and it
//! tracks how many threads are currently using it. Status and count live in
//! one `u32` so that both change together in a single compare-and-swap:
//!
//! ```text
//! bit 31     stopped
//! bit 30     prepare
//! bits 0-29  active client count
//! ```
//!
//! # Transitions
//!
//! - `prepare`: Active -> Prepare, fails once stopped
//! - `stop_client`: Active -> Stopped, refused while preparing or stopped
//! - `close_client`: any -> Stopped, always succeeds
//! - `increment_active_clients` fails once stopped
//! - `reset` returns to Active with no clients

use std::sync::atomic::{AtomicU32, Ordering};

const STOPPED: u32 = 1 << 31;
const PREPARE: u32 = 1 << 30;
const STATUS_MASK: u32 = STOPPED | PREPARE;
const CLIENT_MASK: u32 = !STATUS_MASK;
const INITIAL_STATE: u32 = 0;

/// Largest number of concurrent users a client can track.
pub const MAX_ACTIVE_CLIENTS: u32 = CLIENT_MASK;

/// Decoded state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Active(u32),
    Prepare(u32),
    Stopped(u32),
}

impl ClientState {
    const fn decode(word: u32) -> Self {
        let clients = word & CLIENT_MASK;
        if word & STOPPED != 0 {
            Self::Stopped(clients)
        } else if word & PREPARE != 0 {
            Self::Prepare(clients)
        } else {
            Self::Active(clients)
        }
    }

    #[must_use]
    pub const fn active_clients(self) -> u32 {
        match self {
            Self::Active(n) | Self::Prepare(n) | Self::Stopped(n) => n,
        }
    }
}

/// Shared state of one lock client.
#[derive(Debug, Default)]
pub struct LockClientState {
    word: AtomicU32,
}

impl LockClientState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(INITIAL_STATE),
        }
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        ClientState::decode(self.word.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn has_active_clients(&self) -> bool {
        self.state().active_clients() > 0
    }

    #[must_use]
    pub fn is_single_client(&self) -> bool {
        self.state().active_clients() == 1
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self.state(), ClientState::Stopped(_))
    }

    #[must_use]
    pub fn is_prepared(&self) -> bool {
        matches!(self.state(), ClientState::Prepare(_))
    }

    /// Move to Prepare unless already stopped.
    pub fn prepare(&self) -> Result<(), LockClientError> {
        self.update(|word| {
            if word & STOPPED != 0 {
                Err(LockClientError::Stopped)
            } else {
                Ok(with_status(word, PREPARE))
            }
        })
    }

    /// Move to Stopped unless preparing or already stopped.
    ///
    /// Returns whether this call stopped the client.
    pub fn stop_client(&self) -> bool {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word & STATUS_MASK == 0).then_some(with_status(word, STOPPED))
            })
            .is_ok()
    }

    /// Move to Stopped regardless of the current status.
    pub fn close_client(&self) {
        // Clears PREPARE too; the client count is carried over
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let next = with_status(current, STOPPED);
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn increment_active_clients(&self) -> Result<(), LockClientError> {
        self.update(|word| {
            if word & STOPPED != 0 {
                return Err(LockClientError::Stopped);
            }
            if word & CLIENT_MASK == MAX_ACTIVE_CLIENTS {
                return Err(LockClientError::TooManyClients);
            }
            Ok(word + 1)
        })
    }

    pub fn decrement_active_clients(&self) -> Result<(), LockClientError> {
        self.update(|word| {
            if word & CLIENT_MASK == 0 {
                Err(LockClientError::NoActiveClients)
            } else {
                Ok(word - 1)
            }
        })
    }

    /// Return to Active with no clients, whatever the current state.
    pub fn reset(&self) {
        self.word.store(INITIAL_STATE, Ordering::Release);
    }

    fn update(
        &self,
        mut transition: impl FnMut(u32) -> Result<u32, LockClientError>,
    ) -> Result<(), LockClientError> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let next = transition(current)?;
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

const fn with_status(word: u32, status: u32) -> u32 {
    status | (word & CLIENT_MASK)
}

/// Errors returned by lock client state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockClientError {
    /// The client has been stopped.
    Stopped,
    /// Decrement without a matching increment.
    NoActiveClients,
    /// Active client count would overflow.
    TooManyClients,
}

impl std::fmt::Display for LockClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "lock client has been stopped"),
            Self::NoActiveClients => write!(f, "no active clients to release"),
            Self::TooManyClients => {
                write!(f, "active client count exceeds {MAX_ACTIVE_CLIENTS}")
            }
        }
    }
}

impl std::error::Error for LockClientError {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_initial_state() {
        let state = LockClientState::new();
        assert_eq!(state.state(), ClientState::Active(0));
        assert!(!state.has_active_clients());
        assert!(!state.is_stopped());
        assert!(!state.is_prepared());
    }

    #[test]
    fn test_client_counting() {
        let state = LockClientState::new();
        state.increment_active_clients().unwrap();
        assert!(state.is_single_client());
        state.increment_active_clients().unwrap();
        assert_eq!(state.state(), ClientState::Active(2));

        state.decrement_active_clients().unwrap();
        state.decrement_active_clients().unwrap();
        assert_eq!(
            state.decrement_active_clients(),
            Err(LockClientError::NoActiveClients)
        );
        assert_eq!(state.state(), ClientState::Active(0));
    }

    #[test]
    fn test_prepare_blocks_stop_but_not_close() {
        let state = LockClientState::new();
        state.increment_active_clients().unwrap();
        state.prepare().unwrap();
        assert_eq!(state.state(), ClientState::Prepare(1));

        assert!(!state.stop_client());
        assert!(state.is_prepared());

        state.close_client();
        assert_eq!(state.state(), ClientState::Stopped(1));
    }

    #[test]
    fn test_stopped_client_rejects_work() {
        let state = LockClientState::new();
        state.increment_active_clients().unwrap();
        assert!(state.stop_client());
        assert!(!state.stop_client());
        assert_eq!(state.state(), ClientState::Stopped(1));

        assert_eq!(state.prepare(), Err(LockClientError::Stopped));
        assert_eq!(
            state.increment_active_clients(),
            Err(LockClientError::Stopped)
        );
        // Users that were already in can still leave
        state.decrement_active_clients().unwrap();
        assert_eq!(state.state(), ClientState::Stopped(0));

        state.close_client();
        assert!(state.is_stopped());
    }

    #[test]
    fn test_close_keeps_concurrent_client_counts() {
        let state = Arc::new(LockClientState::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    (0..1000)
                        .filter(|_| state.increment_active_clients().is_ok())
                        .count()
                })
            })
            .collect();
        state.close_client();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(state.is_stopped());
        assert_eq!(
            state.state(),
            ClientState::Stopped(u32::try_from(admitted).unwrap())
        );
    }

    #[test]
    fn test_reset() {
        let state = LockClientState::new();
        state.increment_active_clients().unwrap();
        state.close_client();
        state.reset();
        assert_eq!(state.state(), ClientState::Active(0));
        state.increment_active_clients().unwrap();
    }

    #[test]
    fn test_count_saturates() {
        let state = LockClientState {
            word: AtomicU32::new(MAX_ACTIVE_CLIENTS),
        };
        assert_eq!(
            state.increment_active_clients(),
            Err(LockClientError::TooManyClients)
        );
        assert_eq!(state.state(), ClientState::Active(MAX_ACTIVE_CLIENTS));
    }

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn test_concurrent_increments_and_stop() {
        let state = Arc::new(LockClientState::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    let mut admitted = 0u32;
                    for _ in 0..1_000 {
                        if state.increment_active_clients().is_ok() {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        std::thread::yield_now();
        let stopped = state.stop_client();
        let admitted: u32 = threads.into_iter().map(|t| t.join().unwrap()).sum();

        let final_state = state.state();
        assert_eq!(final_state.active_clients(), admitted);
        if stopped {
            assert_eq!(final_state, ClientState::Stopped(admitted));
        }
    }
}
