use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NetStatus {
    Online,
    Offline,
}

impl NetStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetStatus::Online)
    }
}

type Listener = Arc<dyn Fn(NetStatus) + Send + Sync>;

/// Handle returned by [`ConnectivityMonitor::subscribe`]; pass it back
/// to `unsubscribe` to stop receiving transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
}

struct MonitorState {
    link_up: bool,
    // None until the platform reports reachability; link-only is then
    // accepted as best-effort (captive portals go undetected).
    reachable: Option<bool>,
    status: NetStatus,
    listeners: HashMap<u64, Listener>,
    next_id: u64,
}

/// Best-known device connectivity as an explicit two-state machine.
///
/// The platform shell feeds in link and reachability signals; `Online`
/// requires both when reachability is available. Every status change
/// funnels through one dispatch point, so listeners fire exactly once
/// per genuine transition and never retroactively on subscribe.
pub struct ConnectivityMonitor {
    state: Mutex<MonitorState>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// Starts `Offline` until the platform reports a signal.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                link_up: false,
                reachable: None,
                status: NetStatus::Offline,
                listeners: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub fn current_status(&self) -> NetStatus {
        self.lock().status
    }

    pub fn report_link(&self, up: bool) {
        self.apply(|state| state.link_up = up);
    }

    pub fn report_reachability(&self, reachable: bool) {
        self.apply(|state| state.reachable = Some(reachable));
    }

    pub fn subscribe(&self, listener: impl Fn(NetStatus) + Send + Sync + 'static) -> Subscription {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, Arc::new(listener));
        Subscription { id }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.lock().listeners.remove(&subscription.id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        // A poisoned lock means a listener panicked; the status map
        // itself is still coherent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // The single transition-dispatch point: mutate signals, recompute
    // effective status, and notify on genuine change only. Listeners
    // run outside the lock so they may call back into the monitor.
    fn apply(&self, mutate: impl FnOnce(&mut MonitorState)) {
        let (status, listeners) = {
            let mut state = self.lock();
            mutate(&mut state);

            let effective = if state.link_up && state.reachable.unwrap_or(true) {
                NetStatus::Online
            } else {
                NetStatus::Offline
            };

            if effective == state.status {
                return;
            }
            state.status = effective;

            let listeners: Vec<Listener> = state.listeners.values().cloned().collect();
            (effective, listeners)
        };

        info!(?status, "connectivity transition");
        for listener in listeners {
            listener(status);
        }
    }
}
