//! Element trait for the local engine.

use crate::caps::Caps;
use crate::engine::{BusMessage, GraphState, Opaque, PropertyType, PropertyValue};
use crate::error::Result;
use crate::event::PadEvent;
use crate::packet::Packet;
use bytes::Bytes;
use smallvec::SmallVec;
use std::time::Instant;

// ============================================================================
// Role
// ============================================================================

/// Position an element can take in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementRole {
    /// Head of a chain; fed by a pull callback.
    Source,
    /// Has a sink and a source pad.
    Transform,
    /// End of a chain.
    Sink,
}

impl ElementRole {
    /// Whether the element has a sink pad.
    pub fn has_sink_pad(self) -> bool {
        !matches!(self, ElementRole::Source)
    }

    /// Whether the element has a source pad.
    pub fn has_src_pad(self) -> bool {
        !matches!(self, ElementRole::Sink)
    }
}

// ============================================================================
// Properties
// ============================================================================

#[derive(Clone)]
struct PropertyEntry {
    name: &'static str,
    value: PropertyValue,
    writable: bool,
}

/// Typed property storage of one element.
///
/// Types are fixed when the table is built. The engine checks types and
/// writability before anything reaches [`PropertyTable::update`].
#[derive(Clone, Default)]
pub struct PropertyTable {
    entries: SmallVec<[PropertyEntry; 6]>,
}

impl PropertyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a writable property with its default value.
    pub fn with(mut self, name: &'static str, value: PropertyValue) -> Self {
        self.entries.push(PropertyEntry {
            name,
            value,
            writable: true,
        });
        self
    }

    /// Add a property only the element itself updates.
    pub fn with_read_only(mut self, name: &'static str, value: PropertyValue) -> Self {
        self.entries.push(PropertyEntry {
            name,
            value,
            writable: false,
        });
        self
    }

    fn entry(&self, name: &str) -> Option<&PropertyEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Registered type of a property.
    pub fn property_type(&self, name: &str) -> Option<PropertyType> {
        self.entry(name).map(|e| e.value.property_type())
    }

    /// Whether the property accepts external writes.
    pub fn is_writable(&self, name: &str) -> Option<bool> {
        self.entry(name).map(|e| e.writable)
    }

    /// Current value.
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entry(name).map(|e| &e.value)
    }

    /// Replace a value. Values of a different type are ignored.
    pub fn update(&mut self, name: &str, value: PropertyValue) -> bool {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) if entry.value.property_type() == value.property_type() => {
                entry.value = value;
                true
            }
            _ => false,
        }
    }

    /// String value, if the property is a string.
    pub fn string(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(PropertyValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Integer value, if the property is an int64.
    pub fn int64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(PropertyValue::Int64(i)) => Some(*i),
            _ => None,
        }
    }

    /// Boolean value, if the property is a bool.
    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(PropertyValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Opaque value, if set.
    pub fn opaque(&self, name: &str) -> Option<Opaque> {
        match self.get(name) {
            Some(PropertyValue::Opaque(o)) => o.clone(),
            _ => None,
        }
    }

    /// Bump an integer property by `delta`.
    pub fn increment(&mut self, name: &str, delta: i64) {
        if let Some(current) = self.int64(name) {
            self.update(name, PropertyValue::Int64(current.saturating_add(delta)));
        }
    }

    /// Property names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|e| e.name)
    }
}

impl std::fmt::Debug for PropertyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (e.name, &e.value)))
            .finish()
    }
}

// ============================================================================
// Process context
// ============================================================================

/// Side effects collected while an element handles a packet or event.
///
/// The engine applies them after releasing its graph lock.
pub struct ProcessContext {
    now: Instant,
    current: String,
    pushes: SmallVec<[(String, Bytes); 2]>,
    messages: SmallVec<[BusMessage; 1]>,
}

impl ProcessContext {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            now,
            current: String::new(),
            pushes: SmallVec::new(),
            messages: SmallVec::new(),
        }
    }

    pub(crate) fn enter(&mut self, element: &str) {
        self.current.clear();
        self.current.push_str(element);
    }

    /// Time the engine started this pass.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Name of the element being run.
    pub fn element(&self) -> &str {
        &self.current
    }

    /// Hand `data` to this element's push callback.
    pub fn push(&mut self, data: Bytes) {
        let target = self.current.clone();
        self.pushes.push((target, data));
    }

    /// Hand `data` to the push callback of the element named `target`.
    pub fn push_to(&mut self, target: impl Into<String>, data: Bytes) {
        self.pushes.push((target.into(), data));
    }

    /// Post a message on the bus.
    pub fn post(&mut self, message: BusMessage) {
        self.messages.push(message);
    }

    pub(crate) fn take_pushes(&mut self) -> SmallVec<[(String, Bytes); 2]> {
        std::mem::take(&mut self.pushes)
    }

    pub(crate) fn take_messages(&mut self) -> SmallVec<[BusMessage; 1]> {
        std::mem::take(&mut self.messages)
    }
}

// ============================================================================
// Element trait
// ============================================================================

/// An element of the local engine.
///
/// Elements run on the streaming thread with the graph lock held; they must
/// not block.
pub trait Element: Send {
    /// Factory name this element was created from.
    fn factory(&self) -> &'static str;

    /// Position in a chain.
    fn role(&self) -> ElementRole;

    /// Property storage.
    fn properties(&self) -> &PropertyTable;

    /// Mutable property storage.
    fn properties_mut(&mut self) -> &mut PropertyTable;

    /// Called for each adjacent state step.
    fn change_state(&mut self, _from: GraphState, _to: GraphState) -> Result<()> {
        Ok(())
    }

    /// Caps announced at stream start (sources only).
    fn caps(&self) -> Option<Caps> {
        None
    }

    /// Handle a packet. `None` consumes it.
    fn process(&mut self, packet: Packet, _ctx: &mut ProcessContext) -> Result<Option<Packet>> {
        Ok(Some(packet))
    }

    /// Handle an event arriving at this element. `None` stops it here.
    fn handle_event(&mut self, event: PadEvent, _ctx: &mut ProcessContext) -> Option<PadEvent> {
        Some(event)
    }

    /// Whether packets this element emits leave through a push callback.
    fn has_push_slot(&self) -> bool {
        false
    }

    /// Receiver of processed packets, for sinks that expose output.
    fn output(&self) -> Option<kanal::Receiver<Packet>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_property_table_types() {
        let mut table = PropertyTable::new()
            .with("caps", PropertyValue::String(String::new()))
            .with("user-data", PropertyValue::Opaque(None))
            .with_read_only("packets", PropertyValue::Int64(0));

        assert_eq!(table.property_type("caps"), Some(PropertyType::String));
        assert_eq!(table.property_type("user-data"), Some(PropertyType::Opaque));
        assert_eq!(table.is_writable("packets"), Some(false));
        assert_eq!(table.property_type("missing"), None);

        // Wrong type is ignored
        assert!(!table.update("caps", PropertyValue::Int64(3)));
        assert_eq!(table.string("caps"), Some(""));

        table.increment("packets", 2);
        assert_eq!(table.int64("packets"), Some(2));

        let data: Opaque = Arc::new(7u8);
        assert!(table.update("user-data", PropertyValue::Opaque(Some(data))));
        assert!(table.opaque("user-data").is_some());
        assert_eq!(table.names().count(), 3);
    }

    #[test]
    fn test_context_collects_pushes() {
        let mut ctx = ProcessContext::new(Instant::now());
        ctx.enter("fb");
        ctx.push(Bytes::from_static(b"rr"));
        ctx.push_to("other", Bytes::from_static(b"x"));
        let pushes = ctx.take_pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].0, "fb");
        assert_eq!(pushes[1].0, "other");
        assert!(ctx.take_pushes().is_empty());
    }
}
