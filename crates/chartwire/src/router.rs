//! Event router: name-keyed listener registry shared by every resource of a session.
//!
//! Dispatch snapshots the listener list for the event name before invoking
//! anything, so a listener may unregister itself (or others) mid-dispatch
//! without disturbing the current cycle. Registration hands back a
//! [`Subscription`] guard which unregisters on drop.
//!
//! Besides listeners the router counts [`Lease`]s, held by live resources
//! (charts, series, studies, quote sessions). The registry is idle when both
//! counts are zero; the transition into idle fires [`EventRouter::idle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::trace;

use crate::message::Event;
use crate::metrics;

/// Callback invoked for every dispatched event on its channel
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Registry-unique listener identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
    leases: usize,
}

impl Registry {
    fn is_idle(&self) -> bool {
        self.leases == 0 && self.listeners.is_empty()
    }
}

#[derive(Default)]
pub struct EventRouter {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    idle: Notify,
}

impl EventRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `listener` on `channel`. Returns its id for [`unregister`](Self::unregister).
    pub fn register(&self, channel: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.lock();
        registry
            .listeners
            .entry(channel.to_string())
            .or_default()
            .push((id, listener));
        metrics::inc_listeners();
        trace!(channel = %channel, listener = id.0, "Listener registered");
        id
    }

    /// Register and wrap the registration in a guard.
    pub fn subscribe(self: &Arc<Self>, channel: &str, listener: Listener) -> Subscription {
        let id = self.register(channel, listener);
        Subscription {
            router: Arc::downgrade(self),
            channel: channel.to_string(),
            id: Some(id),
        }
    }

    /// Remove a listener. Idempotent: returns false if it was not registered.
    ///
    /// When this leaves the registry idle, the idle notification fires.
    pub fn unregister(&self, channel: &str, id: ListenerId) -> bool {
        let now_idle = {
            let mut registry = self.lock();
            let Some(entries) = registry.listeners.get_mut(channel) else {
                return false;
            };
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.len() == before {
                return false;
            }
            if entries.is_empty() {
                registry.listeners.remove(channel);
            }
            registry.is_idle()
        };

        metrics::dec_listeners();
        trace!(channel = %channel, listener = id.0, "Listener unregistered");
        if now_idle {
            self.idle.notify_one();
        }
        true
    }

    /// Take a lease keeping the registry non-idle until the guard drops.
    pub fn lease(self: &Arc<Self>) -> Lease {
        self.lock().leases += 1;
        Lease {
            router: Arc::downgrade(self),
        }
    }

    fn release(&self) {
        let now_idle = {
            let mut registry = self.lock();
            registry.leases = registry.leases.saturating_sub(1);
            registry.is_idle()
        };
        if now_idle {
            self.idle.notify_one();
        }
    }

    /// Invoke every listener currently registered on the event's channel, in
    /// registration order. Returns how many were invoked.
    pub fn dispatch(&self, event: &Event) -> usize {
        let channel = event.channel();
        let snapshot: Vec<Listener> = {
            let registry = self.lock();
            match registry.listeners.get(channel) {
                Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => Vec::new(),
            }
        };

        metrics::inc_dispatched(channel);
        trace!(event = %event.name, channel = %channel, listeners = snapshot.len(), "Dispatching event");
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    /// Listeners registered on one channel
    pub fn listener_count(&self, channel: &str) -> usize {
        self.lock().listeners.get(channel).map_or(0, Vec::len)
    }

    /// Listeners registered across all channels
    pub fn total_listeners(&self) -> usize {
        self.lock().listeners.values().map(Vec::len).sum()
    }

    /// Live leases
    pub fn leases(&self) -> usize {
        self.lock().leases
    }

    /// No listeners and no leases
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Channel names with at least one listener
    pub fn channels(&self) -> Vec<String> {
        self.lock().listeners.keys().cloned().collect()
    }

    /// Resolves after the registry goes from busy to idle.
    ///
    /// A transition that happened before the call and was never awaited is
    /// still observed, since the notification stores a permit.
    pub async fn idle(&self) {
        self.idle.notified().await
    }

    /// Drop every listener without firing the idle notification.
    pub(crate) fn clear(&self) {
        let removed: usize = {
            let mut registry = self.lock();
            let removed = registry.listeners.values().map(Vec::len).sum();
            registry.listeners.clear();
            removed
        };
        metrics::sub_listeners(removed);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps the registry busy while held
pub struct Lease {
    router: Weak<EventRouter>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.release();
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

/// Registration guard. Dropping it unregisters the listener.
pub struct Subscription {
    router: Weak<EventRouter>,
    channel: String,
    id: Option<ListenerId>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn id(&self) -> Option<ListenerId> {
        self.id
    }

    /// Unregister now. Safe to call more than once, including from inside
    /// the listener itself.
    pub fn cancel(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(router) = self.router.upgrade() {
                router.unregister(&self.channel, id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Listener {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        Arc::new(move |event: &Event| {
            log.lock().unwrap().push(format!("{tag}:{}", event.name));
        })
    }

    #[test]
    fn test_dispatch_in_registration_order_and_only_matching_name() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.register("du", recorder(&log, "a"));
        router.register("timescale_update", recorder(&log, "other"));
        router.register("du", recorder(&log, "b"));
        router.register("du", recorder(&log, "c"));

        let invoked = router.dispatch(&Event::new("du", json!([])));
        assert_eq!(invoked, 3);
        assert_eq!(*log.lock().unwrap(), vec!["a:du", "b:du", "c:du"]);
    }

    #[test]
    fn test_error_suffixed_events_go_to_error_channel() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.register("error", recorder(&log, "err"));
        router.register("series_error", recorder(&log, "literal"));

        router.dispatch(&Event::new("series_error", json!(["chart_1"])));
        router.dispatch(&Event::new("critical_error", json!([])));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["err:series_error", "err:critical_error"]
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = router.register("du", recorder(&log, "a"));
        assert!(router.unregister("du", id));
        assert!(!router.unregister("du", id));
        assert!(!router.unregister("missing", id));

        assert_eq!(router.dispatch(&Event::new("du", json!([]))), 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(router.total_listeners(), 0);
        assert!(router.channels().is_empty());
    }

    #[test]
    fn test_self_removal_mid_dispatch_does_not_affect_others() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let once = {
            let slot = Arc::clone(&slot);
            let log = Arc::clone(&log);
            Arc::new(move |event: &Event| {
                log.lock().unwrap().push(format!("once:{}", event.name));
                slot.lock().unwrap().take();
            })
        };
        *slot.lock().unwrap() = Some(router.subscribe("du", once));
        let _after = router.subscribe("du", recorder(&log, "after"));

        router.dispatch(&Event::new("du", json!([1])));
        router.dispatch(&Event::new("du", json!([2])));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["once:du", "after:du", "after:du"]
        );
        assert_eq!(router.listener_count("du"), 1);
    }

    #[test]
    fn test_listener_removed_by_peer_mid_dispatch_still_runs_this_cycle() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let killer = {
            let victim = Arc::clone(&victim);
            Arc::new(move |_: &Event| {
                victim.lock().unwrap().take();
            })
        };
        let _killer = router.subscribe("du", killer);
        *victim.lock().unwrap() = Some(router.subscribe("du", recorder(&log, "victim")));

        router.dispatch(&Event::new("du", json!([])));
        router.dispatch(&Event::new("du", json!([])));

        // snapshot semantics: invoked in the cycle it was removed, never after
        assert_eq!(*log.lock().unwrap(), vec!["victim:du"]);
    }

    #[test]
    fn test_subscription_drop_unregisters() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let sub = router.subscribe("qsd", recorder(&log, "q"));
            assert_eq!(sub.channel(), "qsd");
            assert_eq!(router.listener_count("qsd"), 1);
        }
        assert_eq!(router.listener_count("qsd"), 0);

        let mut sub = router.subscribe("qsd", recorder(&log, "q"));
        sub.cancel();
        sub.cancel();
        assert!(sub.id().is_none());
        assert_eq!(router.total_listeners(), 0);
    }

    #[tokio::test]
    async fn test_idle_fires_when_last_listener_leaves() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = router.subscribe("du", recorder(&log, "a"));
        let b = router.subscribe("timescale_update", recorder(&log, "b"));

        drop(a);
        let early = tokio::time::timeout(Duration::from_millis(20), router.idle()).await;
        assert!(early.is_err(), "idle must not fire while listeners remain");

        drop(b);
        tokio::time::timeout(Duration::from_secs(1), router.idle())
            .await
            .expect("idle should fire once the registry is empty");
    }

    #[tokio::test]
    async fn test_lease_keeps_registry_busy() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let lease = router.lease();
        let sub = router.subscribe("symbol_resolved", recorder(&log, "r"));
        drop(sub);
        assert!(!router.is_idle());
        let early = tokio::time::timeout(Duration::from_millis(20), router.idle()).await;
        assert!(early.is_err(), "a live lease must keep the registry busy");

        drop(lease);
        assert!(router.is_idle());
        assert_eq!(router.leases(), 0);
        tokio::time::timeout(Duration::from_secs(1), router.idle())
            .await
            .expect("idle should fire once the last lease is released");
    }

    #[test]
    fn test_clear_drops_everything() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.register("a", recorder(&log, "a"));
        router.register("b", recorder(&log, "b"));
        router.clear();
        assert_eq!(router.total_listeners(), 0);
    }
}
