use crate::sync::types::ConnectionState;

/// Side effects the event loop performs on behalf of the state machine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    OpenTransport,
    DisposeTransport,
    SendSubscribe,
    StartPolling,
    StopPolling,
    ExpireSession,
    Publish(ConnectionState),
}

/// Push/pull lifecycle: `disconnected -> connecting -> live | degraded`.
///
/// Transitions are pure; the caller executes the returned actions. Once stopped (by
/// `disconnect` or an authentication close) transport callbacks are ignored.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    started: bool,
    force_pull: bool,
    fallback_poll: bool,
    polling: bool,
}

impl ConnectionMachine {
    pub fn new(force_pull: bool, fallback_poll: bool) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            started: false,
            force_pull,
            fallback_poll,
            polling: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn connect(&mut self) -> Vec<ConnectionAction> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        if self.force_pull {
            let mut actions = self.transition(ConnectionState::Degraded);
            actions.extend(self.start_polling());
            return actions;
        }

        let mut actions = self.transition(ConnectionState::Connecting);
        actions.push(ConnectionAction::OpenTransport);
        actions
    }

    pub fn on_open(&mut self) -> Vec<ConnectionAction> {
        if !self.started {
            return Vec::new();
        }
        let mut actions = self.transition(ConnectionState::Live);
        actions.extend(self.stop_polling());
        actions.push(ConnectionAction::SendSubscribe);
        actions
    }

    pub fn on_close(&mut self, auth_failure: bool) -> Vec<ConnectionAction> {
        if !self.started {
            return Vec::new();
        }

        if auth_failure {
            self.started = false;
            let mut actions = vec![ConnectionAction::DisposeTransport];
            actions.extend(self.stop_polling());
            actions.extend(self.transition(ConnectionState::Disconnected));
            actions.push(ConnectionAction::ExpireSession);
            return actions;
        }

        let mut actions = self.transition(ConnectionState::Degraded);
        if self.fallback_poll {
            actions.extend(self.start_polling());
        }
        actions
    }

    /// Errors degrade the state but keep the handle; a close event still follows.
    pub fn on_error(&mut self) -> Vec<ConnectionAction> {
        if !self.started {
            return Vec::new();
        }
        self.transition(ConnectionState::Degraded)
    }

    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        if !self.started {
            return Vec::new();
        }
        self.started = false;

        let mut actions = self.stop_polling();
        actions.push(ConnectionAction::DisposeTransport);
        actions.extend(self.transition(ConnectionState::Disconnected));
        actions
    }

    fn transition(&mut self, next: ConnectionState) -> Vec<ConnectionAction> {
        if self.state == next {
            return Vec::new();
        }
        self.state = next;
        vec![ConnectionAction::Publish(next)]
    }

    fn start_polling(&mut self) -> Option<ConnectionAction> {
        if self.polling {
            return None;
        }
        self.polling = true;
        Some(ConnectionAction::StartPolling)
    }

    fn stop_polling(&mut self) -> Vec<ConnectionAction> {
        if !self.polling {
            return Vec::new();
        }
        self.polling = false;
        vec![ConnectionAction::StopPolling]
    }
}
