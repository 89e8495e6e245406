use std::fmt::{Display, Formatter};

use serde::Serialize;
use tokio::sync::{broadcast, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Reconnecting,
    Stopping,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Stopped)
                | (Running, Reconnecting)
                | (Running, Stopping)
                | (Reconnecting, Running)
                | (Reconnecting, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// A session exists and owns (or is acquiring) resources.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PipelineState::Starting | PipelineState::Running | PipelineState::Reconnecting
        )
    }
}

impl Display for PipelineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: PipelineState,
    pub to: PipelineState,
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

impl Display for InvalidTransition {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "invalid pipeline transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// The single lifecycle value of the pipeline. Changes go through
/// `transition`, which checks the edge atomically and publishes it.
pub struct StateMachine {
    current: watch::Sender<PipelineState>,
    transitions: broadcast::Sender<Transition>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (current, _) = watch::channel(PipelineState::Stopped);
        let (transitions, _) = broadcast::channel(64);
        Self {
            current,
            transitions,
        }
    }

    pub fn current(&self) -> PipelineState {
        *self.current.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.current.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Moves to `to` and returns the previous state. Moving to the current
    /// state is a no-op.
    pub fn transition(&self, to: PipelineState) -> Result<PipelineState, InvalidTransition> {
        let mut outcome = Ok(to);
        self.current.send_if_modified(|state| {
            let from = *state;
            if from == to {
                outcome = Ok(from);
                return false;
            }
            if !from.can_transition_to(to) {
                outcome = Err(InvalidTransition { from, to });
                return false;
            }
            *state = to;
            outcome = Ok(from);
            log::info!("pipeline: {} -> {}", from, to);
            let _ = self.transitions.send(Transition { from, to });
            true
        });
        outcome
    }

    /// Waits until the state satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> PipelineState
    where
        F: Fn(PipelineState) -> bool,
    {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            // the sender lives in self, so the channel cannot close here
            Err(_) => self.current(),
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_lifecycle_edges() {
        let machine = StateMachine::new();
        let mut transitions = machine.transitions();

        for next in [Starting, Running, Reconnecting, Running, Stopping, Stopped] {
            machine.transition(next).unwrap();
        }
        assert_eq!(machine.current(), Stopped);

        let seen: Vec<_> = std::iter::from_fn(|| transitions.try_recv().ok())
            .map(|t| t.to)
            .collect();
        assert_eq!(
            seen,
            vec![Starting, Running, Reconnecting, Running, Stopping, Stopped]
        );
    }

    #[test]
    fn test_rejects_undefined_edges() {
        let machine = StateMachine::new();
        assert_eq!(
            machine.transition(Running),
            Err(InvalidTransition {
                from: Stopped,
                to: Running
            })
        );
        machine.transition(Starting).unwrap();
        machine.transition(Running).unwrap();
        assert!(machine.transition(Starting).is_err());
        assert!(machine.transition(Stopped).is_err());
        assert_eq!(machine.current(), Running);
    }

    #[test]
    fn test_same_state_is_noop() {
        let machine = StateMachine::new();
        let mut transitions = machine.transitions();
        assert_eq!(machine.transition(Stopped), Ok(Stopped));
        assert!(transitions.try_recv().is_err());
    }

    #[test]
    fn test_is_active() {
        assert!(!Stopped.is_active());
        assert!(Starting.is_active());
        assert!(Running.is_active());
        assert!(Reconnecting.is_active());
        assert!(!Stopping.is_active());
    }

    #[tokio::test]
    async fn test_wait_for() {
        let machine = std::sync::Arc::new(StateMachine::new());
        let waiter = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.wait_for(|s| s == Running).await })
        };
        machine.transition(Starting).unwrap();
        machine.transition(Running).unwrap();
        assert_eq!(waiter.await.unwrap(), Running);
    }
}
