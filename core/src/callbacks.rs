//! Hooks fired on circuit state transitions

use std::sync::Arc;

/// Hook invoked with the circuit's name
pub type TransitionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// A state change the breaker went through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

/// Transition hooks registered through the builder
///
/// Hooks run after the breaker has released its lock, so they may call back
/// into the same breaker (for example to read its stats).
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<TransitionHook>,
    pub on_close: Option<TransitionHook>,
    pub on_half_open: Option<TransitionHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, transition: Transition, circuit: &str) {
        let hook = match transition {
            Transition::Opened => &self.on_open,
            Transition::HalfOpened => &self.on_half_open,
            Transition::Closed => &self.on_close,
        };
        if let Some(hook) = hook {
            hook(circuit);
        }
    }

    pub fn trigger_all(&self, transitions: &[Transition], circuit: &str) {
        for transition in transitions {
            self.trigger(*transition, circuit);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
