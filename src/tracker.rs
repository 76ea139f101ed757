//! Correlation table: pending stanza ids mapped to one-shot reply callbacks.
//!
//! At most one callback is pending per id; registering the same id again
//! replaces the earlier callback. Entries older than the reply timeout are
//! handed back by [`Tracker::evict_expired`] so the caller can fail them.

use crate::error::ReplyError;
use crate::stanza::Element;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Receives the reply stanza, or the reason none will arrive.
pub type ReplyCallback = Box<dyn FnOnce(Result<&Element, ReplyError>) + Send>;

struct Pending {
    callback: ReplyCallback,
    registered: Instant,
}

/// Outcome of looking up a stanza's id.
pub enum Taken {
    /// The reply arrived in time.
    Reply(ReplyCallback),
    /// The reply arrived after the timeout but before the entry was swept.
    Late(ReplyCallback),
}

pub struct Tracker {
    pending: HashMap<String, Pending>,
    reply_timeout: Option<Duration>,
}

impl Tracker {
    /// `None` keeps entries until a reply arrives.
    pub fn new(reply_timeout: Option<Duration>) -> Self {
        Self {
            pending: HashMap::new(),
            reply_timeout,
        }
    }

    fn is_expired(&self, pending: &Pending, now: Instant) -> bool {
        self.reply_timeout
            .is_some_and(|timeout| now.saturating_duration_since(pending.registered) >= timeout)
    }

    /// Register `callback` for `id`. Returns the callback it replaced, if any.
    pub fn track(&mut self, id: impl Into<String>, callback: ReplyCallback) -> Option<ReplyCallback> {
        let id = id.into();
        let replaced = self.pending.insert(
            id.clone(),
            Pending {
                callback,
                registered: Instant::now(),
            },
        );
        if replaced.is_some() {
            debug!(id = %id, "Replaced pending tracked callback");
        }
        replaced.map(|p| p.callback)
    }

    /// Remove and return the callback waiting for this stanza's id.
    pub fn take(&mut self, stanza: &Element) -> Option<Taken> {
        let id = stanza.id()?;
        let pending = self.pending.remove(id)?;
        if self.is_expired(&pending, Instant::now()) {
            warn!(id, "Reply arrived after tracking timeout");
            return Some(Taken::Late(pending.callback));
        }
        Some(Taken::Reply(pending.callback))
    }

    /// Remove every entry whose timeout has elapsed at `now`.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<(String, ReplyCallback)> {
        let Some(timeout) = self.reply_timeout else {
            return Vec::new();
        };
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.registered) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                let pending = self.pending.remove(&id)?;
                warn!(id = %id, timeout_secs = timeout.as_secs(), "No reply for tracked stanza, evicted");
                Some((id, pending.callback))
            })
            .collect()
    }

    /// Remove every entry, expired or not.
    pub fn drain(&mut self) -> Vec<(String, ReplyCallback)> {
        self.pending
            .drain()
            .map(|(id, pending)| (id, pending.callback))
            .collect()
    }

    pub fn remove(&mut self, id: &str) -> Option<ReplyCallback> {
        self.pending.remove(id).map(|p| p.callback)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>) -> ReplyCallback {
        let counter = counter.clone();
        Box::new(move |reply: Result<&Element, ReplyError>| {
            if reply.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    fn noop() -> ReplyCallback {
        Box::new(|_: Result<&Element, ReplyError>| {})
    }

    #[test]
    fn test_take_consumes_entry_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tracker = Tracker::new(None);
        tracker.track("q1", counting(&hits));

        let reply = Element::new("iq").with_attr("id", "q1");
        let Some(Taken::Reply(callback)) = tracker.take(&reply) else {
            panic!("expected a pending callback");
        };
        callback(Ok(&reply));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(tracker.take(&reply).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_stanza_without_id_is_not_tracked() {
        let mut tracker = Tracker::new(None);
        tracker.track("q1", noop());
        assert!(tracker.take(&Element::new("presence")).is_none());
        assert!(tracker
            .take(&Element::new("iq").with_attr("id", "other"))
            .is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_last_registration_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut tracker = Tracker::new(None);
        assert!(tracker.track("q1", counting(&first)).is_none());
        assert!(tracker.track("q1", counting(&second)).is_some());

        let reply = Element::new("iq").with_attr("id", "q1");
        match tracker.take(&reply) {
            Some(Taken::Reply(callback)) => callback(Ok(&reply)),
            _ => panic!("expected a pending callback"),
        }
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evict_expired() {
        let mut tracker = Tracker::new(Some(Duration::from_secs(60)));
        tracker.track("q1", noop());
        assert!(tracker.evict_expired(Instant::now()).is_empty());
        let evicted = tracker.evict_expired(Instant::now() + Duration::from_secs(61));
        let ids: Vec<_> = evicted.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["q1".to_string()]);
        assert!(!tracker.contains("q1"));
    }

    #[test]
    fn test_late_reply_is_flagged() {
        let mut tracker = Tracker::new(Some(Duration::ZERO));
        tracker.track("q1", noop());
        assert!(matches!(
            tracker.take(&Element::new("iq").with_attr("id", "q1")),
            Some(Taken::Late(_))
        ));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_no_timeout_never_evicts() {
        let mut tracker = Tracker::new(None);
        tracker.track("q1", noop());
        assert!(tracker
            .evict_expired(Instant::now() + Duration::from_secs(86_400))
            .is_empty());
        assert!(tracker.contains("q1"));
    }

    #[test]
    fn test_drain_empties_table() {
        let mut tracker = Tracker::new(None);
        tracker.track("q1", noop());
        tracker.track("q2", noop());
        let mut ids: Vec<_> = tracker.drain().into_iter().map(|(id, _)| id).collect();
        ids.sort();
        assert_eq!(ids, vec!["q1".to_string(), "q2".to_string()]);
        assert!(tracker.is_empty());
    }
}
