//! Element factory for creating elements from parsed descriptions.

use super::element::Element;
use super::elements::{
    AppSink, CapsFilter, FeedbackSinkElement, Identity, PacketSrc, RtcpReporterElement,
};
use crate::engine::parser::ParsedElement;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Type alias for element constructor functions.
pub type ElementConstructor = fn() -> Box<dyn Element>;

/// Registry of element constructors.
pub struct ElementFactory {
    constructors: HashMap<String, ElementConstructor>,
}

impl ElementFactory {
    /// Create a new factory with built-in elements registered.
    pub fn new() -> Self {
        let mut factory = Self {
            constructors: HashMap::new(),
        };

        factory.register("packetsrc", create_packetsrc);
        factory.register("identity", create_identity);
        factory.register("queue", create_queue);
        factory.register("capsfilter", create_capsfilter);
        factory.register("rtcpreporter", create_rtcpreporter);
        factory.register("feedbacksink", create_feedbacksink);
        factory.register("appsink", create_appsink);

        factory
    }

    /// Register a custom element constructor.
    pub fn register(&mut self, name: &str, constructor: ElementConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    /// Create an element and apply the properties from its description.
    ///
    /// `name` is handled by the graph and skipped here.
    pub fn create(&self, parsed: &ParsedElement) -> Result<Box<dyn Element>> {
        let constructor = self
            .constructors
            .get(&parsed.factory)
            .ok_or_else(|| Error::UnknownElement(parsed.factory.clone()))?;
        let mut element = constructor();

        for (key, literal) in &parsed.properties {
            if key == "name" {
                continue;
            }
            let ty = element.properties().property_type(key).ok_or_else(|| {
                Error::InvalidDescription(format!(
                    "{} has no property '{key}'",
                    parsed.factory
                ))
            })?;
            let value = literal.to_property(ty).ok_or_else(|| {
                Error::InvalidDescription(format!(
                    "cannot set {}.{key} ({ty}) from '{}'",
                    parsed.factory,
                    literal.as_string()
                ))
            })?;
            element.properties_mut().update(key, value);
        }

        Ok(element)
    }

    /// Check if an element type is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// List all available element names.
    pub fn list_elements(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ElementFactory {
    fn default() -> Self {
        Self::new()
    }
}

// Built-in element constructors

fn create_packetsrc() -> Box<dyn Element> {
    Box::new(PacketSrc::new())
}

fn create_identity() -> Box<dyn Element> {
    Box::new(Identity::new())
}

fn create_queue() -> Box<dyn Element> {
    Box::new(Identity::with_factory("queue"))
}

fn create_capsfilter() -> Box<dyn Element> {
    Box::new(CapsFilter::new())
}

fn create_rtcpreporter() -> Box<dyn Element> {
    Box::new(RtcpReporterElement::new())
}

fn create_feedbacksink() -> Box<dyn Element> {
    Box::new(FeedbackSinkElement::new())
}

fn create_appsink() -> Box<dyn Element> {
    Box::new(AppSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parser::parse_description;

    #[test]
    fn test_builtins_registered() {
        let factory = ElementFactory::new();
        for name in ["packetsrc", "appsink", "feedbacksink", "rtcpreporter", "capsfilter"] {
            assert!(factory.is_registered(name), "{name}");
        }
        assert!(!factory.is_registered("x264enc"));
        assert_eq!(factory.list_elements().len(), 7);
    }

    #[test]
    fn test_create_applies_properties() {
        let graph = parse_description("rtcpreporter name=rr ssrc=42 feedback=fb").unwrap();
        let element = ElementFactory::new()
            .create(&graph.chains[0][0])
            .unwrap();
        assert_eq!(element.properties().int64("ssrc"), Some(42));
        assert_eq!(element.properties().string("feedback"), Some("fb"));
    }

    #[test]
    fn test_create_rejects_unknown() {
        let factory = ElementFactory::new();
        let graph = parse_description("x264enc").unwrap();
        assert!(matches!(
            factory.create(&graph.chains[0][0]),
            Err(Error::UnknownElement(_))
        ));

        let graph = parse_description("identity bogus=1").unwrap();
        assert!(matches!(
            factory.create(&graph.chains[0][0]),
            Err(Error::InvalidDescription(_))
        ));
    }
}
