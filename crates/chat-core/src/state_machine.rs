use crate::{
    error::ChatError,
    types::{ChatEvent, LifecycleState},
};

#[derive(Debug, Clone)]
pub struct ClientStateMachine {
    state: LifecycleState,
}

impl Default for ClientStateMachine {
    fn default() -> Self {
        Self {
            state: LifecycleState::Unauthenticated,
        }
    }
}

impl ClientStateMachine {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, LifecycleState::Idle | LifecycleState::Polling)
    }

    /// Enter `Authenticating`. Reconnecting from an authenticated state is allowed.
    pub fn begin_connect(&mut self) -> Result<Vec<ChatEvent>, ChatError> {
        self.ensure_not_disposed()?;
        self.transition_from_any_of(
            &[
                LifecycleState::Unauthenticated,
                LifecycleState::Idle,
                LifecycleState::Polling,
            ],
            LifecycleState::Authenticating,
            "connect",
        )
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<Vec<ChatEvent>, ChatError> {
        self.ensure_not_disposed()?;
        let next = if success {
            LifecycleState::Idle
        } else {
            LifecycleState::Unauthenticated
        };
        self.transition_from_state(LifecycleState::Authenticating, next, "on_auth_result")
    }

    /// `Idle → Polling`; already polling is a no-op.
    pub fn start_polling(&mut self) -> Result<Vec<ChatEvent>, ChatError> {
        match self.state {
            LifecycleState::Polling => Ok(Vec::new()),
            LifecycleState::Unauthenticated => Err(ChatError::not_authenticated()),
            LifecycleState::Disposed => Err(ChatError::disposed()),
            _ => self.transition_from_state(
                LifecycleState::Idle,
                LifecycleState::Polling,
                "start_polling",
            ),
        }
    }

    /// `Polling → Idle`; already idle is a no-op.
    pub fn stop_polling(&mut self) -> Result<Vec<ChatEvent>, ChatError> {
        match self.state {
            LifecycleState::Idle => Ok(Vec::new()),
            LifecycleState::Unauthenticated => Err(ChatError::not_authenticated()),
            LifecycleState::Disposed => Err(ChatError::disposed()),
            _ => self.transition_from_state(
                LifecycleState::Polling,
                LifecycleState::Idle,
                "stop_polling",
            ),
        }
    }

    pub fn reset(&mut self) -> Result<Vec<ChatEvent>, ChatError> {
        self.ensure_not_disposed()?;
        if self.state == LifecycleState::Unauthenticated {
            return Ok(Vec::new());
        }
        self.state = LifecycleState::Unauthenticated;
        Ok(vec![ChatEvent::StateChanged { state: self.state }])
    }

    pub fn dispose(&mut self) -> Vec<ChatEvent> {
        if self.state == LifecycleState::Disposed {
            return Vec::new();
        }
        self.state = LifecycleState::Disposed;
        vec![ChatEvent::StateChanged {
            state: LifecycleState::Disposed,
        }]
    }

    fn ensure_not_disposed(&self) -> Result<(), ChatError> {
        if self.state == LifecycleState::Disposed {
            return Err(ChatError::disposed());
        }
        Ok(())
    }

    fn transition_from_state(
        &mut self,
        expected: LifecycleState,
        next: LifecycleState,
        action: &str,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        if self.state != expected {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![ChatEvent::StateChanged { state: next }])
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[LifecycleState],
        next: LifecycleState,
        action: &str,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        if !expected.contains(&self.state) {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![ChatEvent::StateChanged { state: next }])
    }
}
