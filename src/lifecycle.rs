//! Service lifecycle state machine shared by connections and the subscriber.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, not started.
    New,
    /// Start requested, not yet running.
    Starting,
    /// Running.
    Running,
    /// Stop requested, draining.
    Stopping,
    /// Stopped normally.
    Terminated,
    /// Stopped because of an error.
    Failed,
}

impl State {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Terminated | State::Failed)
    }

    /// Label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            State::New => "new",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Terminated => "terminated",
            State::Failed => "failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit state machine with a watch channel for listeners.
///
/// Transitions are checked: each `notify_*` method only moves forward from the states
/// it names. `Failed` is absorbing and keeps the first failure cause.
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    state: watch::Sender<State>,
    failure: Mutex<Option<Arc<Error>>>,
}

impl Lifecycle {
    /// Create a lifecycle in [`State::New`].
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(State::New);
        Self {
            name: name.into(),
            state,
            failure: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Whether the service is starting or running.
    pub fn is_alive(&self) -> bool {
        matches!(self.state(), State::Starting | State::Running)
    }

    fn transition(&self, from: &[State], to: State) -> Option<State> {
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if !from.contains(current) {
                return false;
            }
            previous = Some(*current);
            *current = to;
            true
        });
        if let Some(previous) = previous {
            debug!(service = %self.name, from = %previous, to = %to, "Lifecycle transition");
        }
        previous
    }

    /// `New -> Starting`.
    pub fn notify_starting(&self) -> Result<()> {
        self.transition(&[State::New], State::Starting)
            .map(|_| ())
            .ok_or_else(|| self.illegal("start"))
    }

    /// `Starting -> Running`. Returns whether the transition happened.
    pub fn notify_started(&self) -> bool {
        self.transition(&[State::Starting], State::Running).is_some()
    }

    /// `Starting | Running -> Stopping`. Returns the previous state on success.
    pub fn notify_stopping(&self) -> Option<State> {
        self.transition(&[State::Starting, State::Running], State::Stopping)
    }

    /// Any non-terminal state `-> Terminated`. Returns whether the transition happened.
    pub fn notify_stopped(&self) -> bool {
        self.transition(
            &[State::New, State::Starting, State::Running, State::Stopping],
            State::Terminated,
        )
        .is_some()
    }

    /// `Starting | Running | Stopping -> Failed`, recording `cause`.
    ///
    /// Returns whether this call failed the service; later failures are ignored.
    pub fn notify_failed(&self, cause: Arc<Error>) -> bool {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        let failed = self
            .transition(
                &[State::Starting, State::Running, State::Stopping],
                State::Failed,
            )
            .is_some();
        if failed {
            *failure = Some(cause);
        }
        failed
    }

    /// The error that failed the service, if any.
    pub fn failure_cause(&self) -> Option<Arc<Error>> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the service is running.
    ///
    /// Fails if the service reaches a terminal state first.
    pub async fn await_running(&self) -> Result<()> {
        let state = self.wait_for(|s| s == State::Running || s.is_terminal()).await;
        match state {
            State::Running => Ok(()),
            State::Failed => Err(self.failed_error()),
            other => Err(Error::IllegalState(format!(
                "{} reached {} before running",
                self.name, other
            ))),
        }
    }

    /// Wait until the service reaches a terminal state.
    ///
    /// Fails with the failure cause if the service failed.
    pub async fn await_terminated(&self) -> Result<()> {
        match self.wait_for(State::is_terminal).await {
            State::Failed => Err(self.failed_error()),
            _ => Ok(()),
        }
    }

    async fn wait_for(&self, predicate: impl Fn(State) -> bool) -> State {
        let mut receiver = self.subscribe();
        let result = receiver.wait_for(|s| predicate(*s)).await.map(|s| *s);
        // The sender lives in `self`, so the channel cannot close while we borrow it.
        result.unwrap_or_else(|_| self.state())
    }

    fn failed_error(&self) -> Error {
        match self.failure_cause() {
            Some(cause) => Error::SubscriberFailed(cause),
            None => Error::Internal(format!("{} failed without a cause", self.name)),
        }
    }

    fn illegal(&self, action: &str) -> Error {
        Error::IllegalState(format!(
            "cannot {} {} in state {}",
            action,
            self.name,
            self.state()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_happy_path() {
        let lifecycle = Lifecycle::new("test");
        assert_eq!(lifecycle.state(), State::New);

        lifecycle.notify_starting().unwrap();
        assert!(lifecycle.is_alive());
        assert!(lifecycle.notify_started());
        assert_eq!(lifecycle.notify_stopping(), Some(State::Running));
        assert!(!lifecycle.is_alive());
        assert!(lifecycle.notify_stopped());
        assert_eq!(lifecycle.state(), State::Terminated);
    }

    #[test]
    fn test_start_twice_is_illegal() {
        let lifecycle = Lifecycle::new("test");
        lifecycle.notify_starting().unwrap();
        assert!(matches!(
            lifecycle.notify_starting(),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_failed_is_absorbing_and_keeps_first_cause() {
        let lifecycle = Lifecycle::new("test");
        lifecycle.notify_starting().unwrap();
        lifecycle.notify_started();

        assert!(lifecycle.notify_failed(Arc::new(Error::Internal("first".to_string()))));
        assert!(!lifecycle.notify_failed(Arc::new(Error::Internal("second".to_string()))));
        assert!(!lifecycle.notify_stopped());

        assert_eq!(lifecycle.state(), State::Failed);
        assert!(lifecycle.failure_cause().unwrap().to_string().contains("first"));
    }

    #[test]
    fn test_new_cannot_fail() {
        let lifecycle = Lifecycle::new("test");
        assert!(!lifecycle.notify_failed(Arc::new(Error::Shutdown)));
        assert_eq!(lifecycle.state(), State::New);
    }

    #[tokio::test]
    async fn test_await_running_reports_failure() {
        let lifecycle = Arc::new(Lifecycle::new("test"));
        lifecycle.notify_starting().unwrap();

        let failer = lifecycle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            failer.notify_failed(Arc::new(Error::rpc(tonic::Code::NotFound, "missing")));
        });

        let err = lifecycle.await_running().await.unwrap_err();
        assert_eq!(err.code(), Some(tonic::Code::NotFound));
        assert!(lifecycle.await_terminated().await.is_err());
    }

    #[tokio::test]
    async fn test_state_changes_are_observable() {
        let lifecycle = Lifecycle::new("test");
        let mut changes = lifecycle.subscribe();

        lifecycle.notify_starting().unwrap();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), State::Starting);

        lifecycle.notify_stopped();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), State::Terminated);
        lifecycle.await_terminated().await.unwrap();
    }
}
