//! Executor lifecycle state machine.

use std::sync::RwLock;

use tracing::warn;

use crate::error::ShellRelayError;
use crate::Result;

/// Lifecycle state of an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorState {
    /// Constructed, transport not yet established.
    #[default]
    Created,
    /// Transport is up; data-plane operations are permitted.
    Connected,
    /// Transport released. A fresh executor is needed to retry.
    Disconnected,
}

impl ExecutorState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Created -> Connected
    /// - Created -> Disconnected
    /// - Connected -> Disconnected
    pub fn can_transition_to(&self, target: ExecutorState) -> bool {
        use ExecutorState::*;
        matches!(
            (*self, target),
            (Created, Connected) | (Created, Disconnected) | (Connected, Disconnected)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: ExecutorState) -> Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(ShellRelayError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutorState::Disconnected)
    }

    /// Check if data-plane operations are allowed.
    pub fn is_connected(&self) -> bool {
        matches!(self, ExecutorState::Connected)
    }
}

/// Lifecycle state shared between the tasks using one executor.
#[derive(Debug, Default)]
pub struct StateCell {
    inner: RwLock<ExecutorState>,
}

impl StateCell {
    /// Create a cell in the `Created` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state. A poisoned lock reads as `Disconnected`.
    pub fn get(&self) -> ExecutorState {
        self.inner
            .read()
            .map(|s| *s)
            .unwrap_or(ExecutorState::Disconnected)
    }

    /// Apply a transition.
    pub fn transition_to(&self, target: ExecutorState) -> Result<()> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| ShellRelayError::LockPoisoned)?;
        state.transition_to(target)
    }

    /// Move to `Disconnected`, returning whether the state changed.
    pub fn close(&self) -> bool {
        match self.inner.write() {
            Ok(mut state) => {
                if state.is_terminal() {
                    false
                } else {
                    *state = ExecutorState::Disconnected;
                    true
                }
            }
            Err(_) => false,
        }
    }

    /// Decide whether `connect()` can return without touching the transport.
    ///
    /// `Some(true)` when already connected, `Some(false)` once disconnected,
    /// `None` when bring-up should proceed.
    pub fn connect_shortcut(&self, machine: &str) -> Option<bool> {
        match self.get() {
            ExecutorState::Created => None,
            ExecutorState::Connected => Some(true),
            ExecutorState::Disconnected => {
                warn!(machine = %machine, "executor was disconnected; construct a new one to reconnect");
                Some(false)
            }
        }
    }

    /// Record a successful bring-up. A concurrent winner counts as success.
    pub fn mark_connected(&self) -> bool {
        self.transition_to(ExecutorState::Connected).is_ok() || self.get().is_connected()
    }

    /// Fail with `NotConnected` unless the state is `Connected`.
    pub fn ensure_connected(&self, what: &str) -> Result<()> {
        if self.get().is_connected() {
            Ok(())
        } else {
            Err(ShellRelayError::NotConnected(what.to_string()))
        }
    }
}
