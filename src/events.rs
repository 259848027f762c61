//! Observer registry for graph changes.
//!
//! Typed callback lists with deterministic FIFO order per event kind, plus
//! a deferred queue. Callbacks fire immediately on emit; the queue is
//! drained at defined points (the end of a graph-edit bracket) so batch
//! consumers see edits in order, once.

use std::sync::Mutex;

use uuid::Uuid;

/// Maximum queued events before the oldest are evicted
const MAX_QUEUE_SIZE: usize = 1000;

/// A change to the graph or one of its nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    NodeAdded(Uuid),
    NodeWillRemove(Uuid),
    InputsChanged(Uuid),
    RangeChanged(Uuid),
    StructureChanged(Uuid),
    PropertyChanged { node: Uuid, key: String },
}

type NodeCallback = Box<dyn Fn(Uuid) + Send + Sync>;
type PropertyCallback = Box<dyn Fn(Uuid, &str) + Send + Sync>;

/// Typed subscription lists + deferred event queue
#[derive(Default)]
pub struct GraphObservers {
    node_added: Mutex<Vec<NodeCallback>>,
    node_will_remove: Mutex<Vec<NodeCallback>>,
    inputs_changed: Mutex<Vec<NodeCallback>>,
    range_changed: Mutex<Vec<NodeCallback>>,
    structure_changed: Mutex<Vec<NodeCallback>>,
    property_changed: Mutex<Vec<PropertyCallback>>,
    queue: Mutex<Vec<GraphEvent>>,
}

impl GraphObservers {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Subscriptions ==========

    pub fn on_node_added(&self, cb: impl Fn(Uuid) + Send + Sync + 'static) {
        self.node_added.lock().unwrap_or_else(|e| e.into_inner()).push(Box::new(cb));
    }

    pub fn on_node_will_remove(&self, cb: impl Fn(Uuid) + Send + Sync + 'static) {
        self.node_will_remove
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(cb));
    }

    pub fn on_inputs_changed(&self, cb: impl Fn(Uuid) + Send + Sync + 'static) {
        self.inputs_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(cb));
    }

    pub fn on_range_changed(&self, cb: impl Fn(Uuid) + Send + Sync + 'static) {
        self.range_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(cb));
    }

    pub fn on_structure_changed(&self, cb: impl Fn(Uuid) + Send + Sync + 'static) {
        self.structure_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(cb));
    }

    pub fn on_property_changed(&self, cb: impl Fn(Uuid, &str) + Send + Sync + 'static) {
        self.property_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(cb));
    }

    // ========== Emission ==========

    pub fn emit(&self, event: GraphEvent) {
        match &event {
            GraphEvent::NodeAdded(id) => self.notify_node(&self.node_added, *id),
            GraphEvent::NodeWillRemove(id) => self.notify_node(&self.node_will_remove, *id),
            GraphEvent::InputsChanged(id) => self.notify_node(&self.inputs_changed, *id),
            GraphEvent::RangeChanged(id) => self.notify_node(&self.range_changed, *id),
            GraphEvent::StructureChanged(id) => self.notify_node(&self.structure_changed, *id),
            GraphEvent::PropertyChanged { node, key } => {
                let cbs = self
                    .property_changed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                for cb in cbs.iter() {
                    cb(*node, key);
                }
            }
        }

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            queue.remove(0);
        }
        queue.push(event);
    }

    fn notify_node(&self, list: &Mutex<Vec<NodeCallback>>, id: Uuid) {
        let cbs = list.lock().unwrap_or_else(|e| e.into_inner());
        for cb in cbs.iter() {
            cb(id);
        }
    }

    /// Take all queued events, in emission order
    pub fn drain(&self) -> Vec<GraphEvent> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *queue)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_immediate_callbacks_fire_in_order() {
        let observers = GraphObservers::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let calls = Arc::clone(&calls);
            observers.on_node_added(move |_| calls.lock().unwrap().push(tag));
        }

        observers.emit(GraphEvent::NodeAdded(Uuid::new_v4()));
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_deferred_queue_drains_once() {
        let observers = GraphObservers::new();
        let id = Uuid::new_v4();
        observers.emit(GraphEvent::NodeAdded(id));
        observers.emit(GraphEvent::RangeChanged(id));

        let events = observers.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], GraphEvent::NodeAdded(id));
        assert!(observers.drain().is_empty());
    }

    #[test]
    fn test_property_callbacks_see_key() {
        let observers = GraphObservers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        observers.on_property_changed(move |_, key| {
            assert_eq!(key, "visual.scale");
            count2.fetch_add(1, Ordering::Relaxed);
        });
        observers.emit(GraphEvent::PropertyChanged {
            node: Uuid::new_v4(),
            key: "visual.scale".into(),
        });
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_queue_bounded() {
        let observers = GraphObservers::new();
        let id = Uuid::new_v4();
        for _ in 0..(MAX_QUEUE_SIZE + 10) {
            observers.emit(GraphEvent::RangeChanged(id));
        }
        assert_eq!(observers.queued(), MAX_QUEUE_SIZE);
    }
}
