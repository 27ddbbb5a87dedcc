//! Typed element property bridge.
//!
//! Three accessors, each checking the registered property type before
//! touching the value. There is no coercion: reading an int64 property as a
//! string is a [`Error::TypeMismatch`].

use crate::engine::{ElementId, GraphEngine, Opaque, PropertyType, PropertyValue};
use crate::error::{Error, Result};
use std::sync::{Arc, Weak};

/// Lookup handle for one element. Does not keep the engine alive.
pub struct ElementHandle<E: GraphEngine> {
    engine: Weak<E>,
    id: ElementId,
    name: String,
}

impl<E: GraphEngine> ElementHandle<E> {
    /// Resolve `name` in `engine`.
    pub fn lookup(engine: &Arc<E>, name: &str) -> Result<Self> {
        let id = engine.element_by_name(name)?;
        Ok(Self {
            engine: Arc::downgrade(engine),
            id,
            name: name.to_string(),
        })
    }

    /// Element id.
    pub fn id(&self) -> ElementId {
        self.id
    }

    /// Element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> Result<Arc<E>> {
        self.engine.upgrade().ok_or(Error::HandleReleased)
    }

    fn check_type(&self, engine: &E, property: &str, expected: PropertyType) -> Result<()> {
        let found = engine.property_type(self.id, property)?;
        if found != expected {
            return Err(Error::TypeMismatch {
                property: property.to_string(),
                expected,
                found,
            });
        }
        Ok(())
    }
}

impl<E: GraphEngine> Clone for ElementHandle<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Weak::clone(&self.engine),
            id: self.id,
            name: self.name.clone(),
        }
    }
}

impl<E: GraphEngine> std::fmt::Debug for ElementHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("released", &(self.engine.strong_count() == 0))
            .finish()
    }
}

/// Typed property accessors.
pub struct ElementProperties<E: GraphEngine> {
    engine: Weak<E>,
}

impl<E: GraphEngine> ElementProperties<E> {
    /// Create accessors for `engine`.
    pub fn new(engine: &Arc<E>) -> Self {
        Self {
            engine: Arc::downgrade(engine),
        }
    }

    /// Look up an element by name.
    pub fn element(&self, name: &str) -> Result<ElementHandle<E>> {
        let engine = self.engine.upgrade().ok_or(Error::HandleReleased)?;
        ElementHandle::lookup(&engine, name)
    }

    /// Store an opaque host value in an opaque-typed property.
    pub fn set_opaque(&self, element: &ElementHandle<E>, name: &str, value: Opaque) -> Result<()> {
        let engine = element.engine()?;
        element.check_type(&engine, name, PropertyType::Opaque)?;
        engine.set_property(element.id, name, PropertyValue::Opaque(Some(value)))?;
        tracing::debug!(element = %element.name, property = name, "opaque property set");
        Ok(())
    }

    /// Read a string-typed property.
    pub fn get_string(&self, element: &ElementHandle<E>, name: &str) -> Result<String> {
        let engine = element.engine()?;
        element.check_type(&engine, name, PropertyType::String)?;
        match engine.get_property(element.id, name)? {
            PropertyValue::String(value) => Ok(value),
            other => Err(Error::TypeMismatch {
                property: name.to_string(),
                expected: PropertyType::String,
                found: other.property_type(),
            }),
        }
    }

    /// Read an int64-typed property.
    pub fn get_int64(&self, element: &ElementHandle<E>, name: &str) -> Result<i64> {
        let engine = element.engine()?;
        element.check_type(&engine, name, PropertyType::Int64)?;
        match engine.get_property(element.id, name)? {
            PropertyValue::Int64(value) => Ok(value),
            other => Err(Error::TypeMismatch {
                property: name.to_string(),
                expected: PropertyType::Int64,
                found: other.property_type(),
            }),
        }
    }
}

impl<E: GraphEngine> Clone for ElementProperties<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Weak::clone(&self.engine),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::LocalEngine;

    fn engine() -> Arc<LocalEngine> {
        Arc::new(
            LocalEngine::from_description(
                "packetsrc name=src caps=\"application/x-rtp\" ! appsink name=out",
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_typed_accessors() {
        let engine = engine();
        let props = ElementProperties::new(&engine);
        let src = props.element("src").unwrap();

        assert_eq!(props.get_string(&src, "caps").unwrap(), "application/x-rtp");
        assert_eq!(props.get_string(&src, "name").unwrap(), "src");
        assert_eq!(props.get_int64(&src, "packets").unwrap(), 0);

        let data: Opaque = Arc::new(String::from("transport"));
        props.set_opaque(&src, "user-data", data).unwrap();
        let stored = engine
            .get_property(src.id(), "user-data")
            .unwrap();
        let PropertyValue::Opaque(Some(stored)) = stored else {
            panic!("opaque not stored");
        };
        assert_eq!(stored.downcast_ref::<String>().unwrap(), "transport");
    }

    #[test]
    fn test_no_coercion() {
        let engine = engine();
        let props = ElementProperties::new(&engine);
        let src = props.element("src").unwrap();

        assert!(matches!(
            props.set_opaque(&src, "caps", Arc::new(1u8)),
            Err(Error::TypeMismatch {
                expected: PropertyType::Opaque,
                found: PropertyType::String,
                ..
            })
        ));
        assert!(matches!(
            props.get_string(&src, "user-data"),
            Err(Error::TypeMismatch { found: PropertyType::Opaque, .. })
        ));
        assert!(matches!(
            props.get_string(&src, "packets"),
            Err(Error::TypeMismatch { found: PropertyType::Int64, .. })
        ));
        assert!(matches!(
            props.get_int64(&src, "missing"),
            Err(Error::UnknownProperty { .. })
        ));
        assert!(matches!(props.element("nope"), Err(Error::UnknownElement(_))));
    }

    #[test]
    fn test_released_engine() {
        let engine = engine();
        let props = ElementProperties::new(&engine);
        let out = props.element("out").unwrap();
        drop(engine);
        assert!(matches!(props.get_int64(&out, "packets"), Err(Error::HandleReleased)));
        assert!(matches!(props.element("out"), Err(Error::HandleReleased)));
    }
}
