use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{Event, EventArgs};

pub type Callback = Arc<dyn Fn(&EventArgs) + Send + Sync>;

/// Handle returned by [`SubscriberRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    name: String,
    id: Uuid,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Local subscribers keyed by event name.
#[derive(Default)]
pub struct SubscriberRegistry {
    callbacks: RwLock<HashMap<String, HashMap<Uuid, Callback>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe<F>(&self, name: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&EventArgs) + Send + Sync + 'static,
    {
        let name = name.into();
        let id = Uuid::new_v4();
        self.callbacks
            .write()
            .await
            .entry(name.clone())
            .or_default()
            .insert(id, Arc::new(callback));
        Subscription { name, id }
    }

    /// Returns false if the subscription was already gone.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut callbacks = self.callbacks.write().await;
        let Some(by_id) = callbacks.get_mut(&subscription.name) else {
            return false;
        };
        let removed = by_id.remove(&subscription.id).is_some();
        if by_id.is_empty() {
            callbacks.remove(&subscription.name);
        }
        removed
    }

    /// Invoke every live subscriber for the event's name with its arguments.
    /// Returns how many callbacks ran.
    pub async fn dispatch(&self, event: &Event) -> usize {
        let targets: Vec<Callback> = match self.callbacks.read().await.get(&event.name) {
            Some(by_id) => by_id.values().cloned().collect(),
            None => return 0,
        };
        for callback in &targets {
            callback(&event.args);
        }
        targets.len()
    }

    pub async fn count(&self, name: &str) -> usize {
        self.callbacks
            .read()
            .await
            .get(name)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}
