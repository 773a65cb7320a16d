//! Id namespaces for groups of related events.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dispatcher::Dispatcher;
use crate::error::{EventError, EventResult};

use super::{validate_id, Event, EventBuilder};

#[derive(Debug)]
pub(crate) struct ContainerInner {
    id: String,
    events: Mutex<BTreeMap<String, Event>>,
}

impl ContainerInner {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn events(&self) -> EventResult<MutexGuard<'_, BTreeMap<String, Event>>> {
        self.events
            .lock()
            .map_err(|_| EventError::poisoned(format!("container '{}'", self.id)))
    }

    pub(crate) fn track(&self, local_id: String, event: &Event) -> EventResult<()> {
        self.events()?.insert(local_id, event.clone());
        Ok(())
    }
}

/// Groups events under a common prefix.
///
/// An event `ready` built through a container `robot` gets the uid
/// `robot:ready`. Containers nest by using a `:`-separated id.
///
/// # Examples
///
/// ```
/// use eventcore::{Dispatcher, EventContainer};
///
/// let dispatcher = Dispatcher::new();
/// let robot = EventContainer::new(&dispatcher, "robot").unwrap();
/// let ready = robot.event("ready").build().unwrap();
/// assert_eq!(ready.uid(), "robot:ready");
/// assert!(robot.event("ready").build().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct EventContainer {
    dispatcher: Dispatcher,
    inner: Arc<ContainerInner>,
}

impl EventContainer {
    pub fn new(dispatcher: &Dispatcher, id: impl Into<String>) -> EventResult<Self> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self {
            dispatcher: dispatcher.clone(),
            inner: Arc::new(ContainerInner {
                id,
                events: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Builder for an event namespaced under this container.
    #[must_use]
    pub fn event(&self, local_id: impl Into<String>) -> EventBuilder {
        Event::builder(&self.dispatcher)
            .id(local_id)
            .within(Arc::clone(&self.inner))
    }

    /// A nested container `self.id:local_id`.
    pub fn child(&self, local_id: &str) -> EventResult<Self> {
        validate_id(local_id)?;
        Self::new(&self.dispatcher, format!("{}:{local_id}", self.inner.id))
    }

    /// Event built through this container under `local_id`.
    pub fn get(&self, local_id: &str) -> EventResult<Option<Event>> {
        Ok(self.inner.events()?.get(local_id).cloned())
    }

    /// Events built through this container, ordered by local id.
    pub fn events(&self) -> EventResult<Vec<Event>> {
        Ok(self.inner.events()?.values().cloned().collect())
    }

    pub fn len(&self) -> EventResult<usize> {
        Ok(self.inner.events()?.len())
    }

    pub fn is_empty(&self) -> EventResult<bool> {
        Ok(self.inner.events()?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn test_container_namespaces_uids() {
        let d = Dispatcher::new();
        let robot = EventContainer::new(&d, "robot").unwrap();
        let ready = robot.event("ready").build().unwrap();
        assert_eq!(ready.id(), "ready");
        assert_eq!(ready.uid(), "robot:ready");
        assert_eq!(robot.get("ready").unwrap(), Some(ready.clone()));
        assert_eq!(d.event("robot:ready"), Some(ready));
    }

    #[test]
    fn test_duplicate_local_id_rejected() {
        let d = Dispatcher::new();
        let robot = EventContainer::new(&d, "robot").unwrap();
        let _first = robot.event("ready").build().unwrap();
        let err = robot.event("ready").build().unwrap_err();
        assert!(matches!(
            err,
            EventError::Validation(ValidationError::DuplicateEventId { .. })
        ));
        assert_eq!(robot.len().unwrap(), 1);
    }

    #[test]
    fn test_same_local_id_in_two_containers() {
        let d = Dispatcher::new();
        let a = EventContainer::new(&d, "arm").unwrap();
        let b = EventContainer::new(&d, "base").unwrap();
        let ea = a.event("ready").build().unwrap();
        let eb = b.event("ready").build().unwrap();
        assert_ne!(ea.uid(), eb.uid());
    }

    #[test]
    fn test_nested_containers() {
        let d = Dispatcher::new();
        let device = EventContainer::new(&d, "device").unwrap();
        let seven = device.child("7").unwrap();
        let hb = seven.event("heartbeat").build().unwrap();
        assert_eq!(hb.uid(), "device:7:heartbeat");
        assert!(device.child("bad id").is_err());
    }
}
