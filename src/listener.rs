//! Feature listener contract and the ordered chain stanzas are offered to.

use crate::session::SessionHandle;
use crate::stanza::Element;

/// A feature module reacting to inbound stanzas.
///
/// `init` runs once the session is online and is where a listener registers
/// its socket events; `unregister_events` must undo all of it.
pub trait Listener: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self, session: SessionHandle);

    fn unregister_events(&mut self);

    /// Whether this listener recognizes the stanza. Must not mutate state.
    fn handles(&self, stanza: &Element) -> bool;

    /// React to a recognized stanza. Returning false lets later listeners
    /// see it as well.
    fn handle(&mut self, stanza: &Element) -> bool;
}

/// Outcome of offering a stanza to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A listener handled the stanza and stopped the walk.
    Stopped(&'static str),
    /// At least one listener recognized it but none stopped the walk.
    Claimed,
    Unclaimed,
}

/// Listeners in precedence order; index 0 runs first.
#[derive(Default)]
pub struct ListenerChain {
    listeners: Vec<Box<dyn Listener>>,
}

impl ListenerChain {
    pub fn new(listeners: Vec<Box<dyn Listener>>) -> Self {
        Self { listeners }
    }

    /// Insert ahead of every existing listener.
    pub fn push_front(&mut self, listener: Box<dyn Listener>) {
        self.listeners.insert(0, listener);
    }

    pub fn init_all(&mut self, session: &SessionHandle) {
        for listener in &mut self.listeners {
            listener.init(session.clone());
        }
    }

    /// Unregister every listener's events, then drop them all.
    pub fn clear(&mut self) {
        for listener in &mut self.listeners {
            listener.unregister_events();
        }
        self.listeners.clear();
    }

    pub fn dispatch(&mut self, stanza: &Element) -> Dispatch {
        let mut claimed = false;
        for listener in &mut self.listeners {
            if !listener.handles(stanza) {
                continue;
            }
            claimed = true;
            if listener.handle(stanza) {
                return Dispatch::Stopped(listener.name());
            }
        }
        if claimed {
            Dispatch::Claimed
        } else {
            Dispatch::Unclaimed
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.listeners.iter().map(|l| l.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
