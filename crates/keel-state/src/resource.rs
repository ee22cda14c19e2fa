//! Typed resource specs and the type-erased resource record stored in the store.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Result, StateError};
use crate::metadata::Metadata;

/// A typed resource spec.
///
/// Each spec type is bound to a fully-qualified type name and the namespace its
/// resources are created in by default.
pub trait ResourceType: Clone + fmt::Debug + PartialEq + Serialize + Send + Sync + 'static {
    /// Fully-qualified type name, e.g. `KernelParamSpecs.runtime.keel.dev`.
    const TYPE: &'static str;
    /// Default namespace.
    const NAMESPACE: &'static str;
}

/// Type-erased spec held by the store.
pub trait AnySpec: Any + fmt::Debug + Send + Sync {
    /// Upcasts to [`Any`] for downcasting to the concrete spec.
    fn as_any(&self) -> &dyn Any;
    /// Compares two specs for equality; specs of different types are never equal.
    fn spec_eq(&self, other: &dyn AnySpec) -> bool;
    /// Type name of the spec.
    fn type_name(&self) -> &'static str;
    /// Structured rendering of the spec.
    fn to_value(&self) -> serde_json::Value;
}

impl<T: ResourceType> AnySpec for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn spec_eq(&self, other: &dyn AnySpec) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|o| o == self)
    }

    fn type_name(&self) -> &'static str {
        T::TYPE
    }

    fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A resource record: metadata plus a type-erased spec.
#[derive(Clone)]
pub struct Resource {
    metadata: Metadata,
    spec: Arc<dyn AnySpec>,
}

impl Resource {
    /// Creates a resource in the spec type's default namespace.
    pub fn new<T: ResourceType>(id: impl Into<String>, spec: T) -> Self {
        Self::new_in(T::NAMESPACE, id, spec)
    }

    /// Creates a resource in the given namespace.
    pub fn new_in<T: ResourceType>(namespace: impl Into<String>, id: impl Into<String>, spec: T) -> Self {
        Resource {
            metadata: Metadata::new(namespace, T::TYPE, id),
            spec: Arc::new(spec),
        }
    }

    /// Builds a resource from existing metadata and a spec.
    pub fn from_parts<T: ResourceType>(metadata: Metadata, spec: T) -> Self {
        Resource {
            metadata,
            spec: Arc::new(spec),
        }
    }

    /// Resource metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable resource metadata.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Returns the spec downcast to `T`, if the types match.
    pub fn spec<T: ResourceType>(&self) -> Option<&T> {
        self.spec.as_any().downcast_ref::<T>()
    }

    /// Type-erased spec.
    pub fn any_spec(&self) -> &dyn AnySpec {
        self.spec.as_ref()
    }

    /// Replaces the spec.
    pub fn set_spec<T: ResourceType>(&mut self, spec: T) {
        self.spec = Arc::new(spec);
    }

    /// Compares specs of two resources.
    pub fn spec_eq(&self, other: &Resource) -> bool {
        self.spec.spec_eq(other.spec.as_ref())
    }

    /// Converts into a typed snapshot.
    pub fn typed<T: ResourceType>(&self) -> Result<Typed<T>> {
        match self.spec::<T>() {
            Some(spec) => Ok(Typed {
                metadata: self.metadata.clone(),
                spec: spec.clone(),
            }),
            None => Err(StateError::TypeMismatch {
                pointer: self.metadata.pointer().clone(),
                actual: self.spec.type_name().to_string(),
                requested: T::TYPE.to_string(),
            }),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("metadata", &self.metadata)
            .field("spec", &self.spec)
            .finish()
    }
}

/// A typed snapshot of a resource.
#[derive(Clone, Debug, PartialEq)]
pub struct Typed<T> {
    /// Metadata at the time of the read.
    pub metadata: Metadata,
    /// Spec.
    pub spec: T,
}

impl<T: ResourceType> Typed<T> {
    /// Id of the resource.
    pub fn id(&self) -> &str {
        self.metadata.id()
    }

    /// Converts back into a type-erased resource.
    pub fn into_resource(self) -> Resource {
        Resource::from_parts(self.metadata, self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    struct Foo {
        value: String,
    }

    impl ResourceType for Foo {
        const TYPE: &'static str = "Foos.test.keel.dev";
        const NAMESPACE: &'static str = "test";
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    struct Bar {
        value: String,
    }

    impl ResourceType for Bar {
        const TYPE: &'static str = "Bars.test.keel.dev";
        const NAMESPACE: &'static str = "test";
    }

    #[test]
    fn test_downcast() {
        let r = Resource::new("a", Foo { value: "x".into() });
        assert_eq!(r.metadata().res_type(), Foo::TYPE);
        assert_eq!(r.spec::<Foo>().map(|f| f.value.as_str()), Some("x"));
        assert!(r.spec::<Bar>().is_none());
        assert!(matches!(r.typed::<Bar>(), Err(StateError::TypeMismatch { .. })));
    }

    #[test]
    fn test_spec_eq_across_types() {
        let a = Resource::new("a", Foo { value: "x".into() });
        let b = Resource::new("a", Foo { value: "x".into() });
        let c = Resource::new("a", Bar { value: "x".into() });
        assert!(a.spec_eq(&b));
        assert!(!a.spec_eq(&c));
    }

    #[test]
    fn test_to_value() {
        let r = Resource::new("a", Foo { value: "x".into() });
        assert_eq!(r.any_spec().to_value(), serde_json::json!({"value": "x"}));
    }
}
