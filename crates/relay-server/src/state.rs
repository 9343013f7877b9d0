//! Authoritative incident list and the accessors sessions read it through.

use std::sync::Arc;

use parking_lot::RwLock;
use relay_protocol::{AicMessage, Alarm, MessageKind, WasObject};
use tracing::debug;

/// Transform an upstream payload into the incident list, keeping order.
pub fn transform(payload: &WasObject) -> Vec<Alarm> {
    payload.alarms.iter().map(Alarm::from_was).collect()
}

/// The incident list handed to every client.
///
/// Replaced wholesale on every changed payload, so readers never observe a
/// partially applied update.
#[derive(Default)]
pub struct AlarmState {
    alarms: RwLock<Arc<Vec<Alarm>>>,
}

impl AlarmState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.alarms.read().as_ref().clone()
    }

    /// Recompute the list from `payload` and return the new list.
    pub fn update(&self, payload: &WasObject) -> Arc<Vec<Alarm>> {
        let alarms = Arc::new(transform(payload));
        *self.alarms.write() = alarms.clone();
        debug!(count = alarms.len(), "Alarm state updated");
        alarms
    }
}

type AlarmsFn = Arc<dyn Fn() -> Vec<Alarm> + Send + Sync>;
type ConnectedFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Read access to the live state. Sessions call these at send time and
/// never cache the result.
#[derive(Clone)]
pub struct StateAccessors {
    alarms: AlarmsFn,
    was_connected: ConnectedFn,
}

impl StateAccessors {
    pub fn new(
        alarms: impl Fn() -> Vec<Alarm> + Send + Sync + 'static,
        was_connected: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            alarms: Arc::new(alarms),
            was_connected: Arc::new(was_connected),
        }
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        (self.alarms)()
    }

    pub fn was_connected(&self) -> bool {
        (self.was_connected)()
    }

    /// An envelope of `kind` carrying the state as of now.
    pub fn envelope(&self, kind: MessageKind) -> AicMessage {
        AicMessage::new(kind, self.was_connected(), self.alarms())
    }
}

impl std::fmt::Debug for StateAccessors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateAccessors").finish_non_exhaustive()
    }
}
