use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::construct::{IdentifiedObject, ATTRIBUTE_TYPE};
use crate::datatype::{Composition, ScalarClass, Value};

// ------------- Attribute -------------
/// Immutable descriptor of a typed property slot on items.
///
/// Equality, ordering and hashing use the id together with the shape
/// (scalar class, composition, propagation), never the display name, so two
/// independently constructed descriptors for the same id are interchangeable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attribute {
    id: Arc<str>,
    name: Arc<str>,
    scalar: ScalarClass,
    composition: Composition,
    propagating: bool,
}

impl Attribute {
    pub fn new(
        id: &str,
        name: &str,
        scalar: ScalarClass,
        composition: Composition,
        propagating: bool,
    ) -> Self {
        assert!(!id.is_empty(), "attribute id must not be empty");
        assert!(
            !propagating || scalar == ScalarClass::Link,
            "only link attributes can propagate changes ({})",
            id
        );
        Self {
            id: Arc::from(id),
            name: Arc::from(name),
            scalar,
            composition,
            propagating,
        }
    }
    pub fn scalar(id: &str, name: &str, scalar: ScalarClass) -> Self {
        Self::new(id, name, scalar, Composition::Scalar, false)
    }
    pub fn long(id: &str, name: &str) -> Self {
        Self::scalar(id, name, ScalarClass::Long)
    }
    pub fn int(id: &str, name: &str) -> Self {
        Self::scalar(id, name, ScalarClass::Int)
    }
    pub fn bool(id: &str, name: &str) -> Self {
        Self::scalar(id, name, ScalarClass::Bool)
    }
    pub fn string(id: &str, name: &str) -> Self {
        Self::scalar(id, name, ScalarClass::Text)
    }
    pub fn bytes(id: &str, name: &str) -> Self {
        Self::scalar(id, name, ScalarClass::Bytes)
    }
    pub fn decimal(id: &str, name: &str) -> Self {
        Self::scalar(id, name, ScalarClass::Decimal)
    }
    pub fn date(id: &str, name: &str) -> Self {
        Self::scalar(id, name, ScalarClass::Date)
    }
    pub fn map(id: &str, name: &str) -> Self {
        Self::scalar(id, name, ScalarClass::Map)
    }
    /// A reference to another item. With `propagating`, a change of the
    /// referring item is also reported as a change of the referenced one.
    pub fn link(id: &str, name: &str, propagating: bool) -> Self {
        Self::new(id, name, ScalarClass::Link, Composition::Scalar, propagating)
    }
    pub fn link_list(id: &str, name: &str, propagating: bool) -> Self {
        Self::new(id, name, ScalarClass::Link, Composition::List, propagating)
    }
    pub fn link_set(id: &str, name: &str, propagating: bool) -> Self {
        Self::new(id, name, ScalarClass::Link, Composition::Set, propagating)
    }
    pub fn list(id: &str, name: &str, scalar: ScalarClass) -> Self {
        Self::new(id, name, scalar, Composition::List, false)
    }
    pub fn set(id: &str, name: &str, scalar: ScalarClass) -> Self {
        Self::new(id, name, scalar, Composition::Set, false)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn scalar_class(&self) -> ScalarClass {
        self.scalar
    }
    pub fn composition(&self) -> Composition {
        self.composition
    }
    pub fn is_propagating(&self) -> bool {
        self.propagating
    }
    pub fn is_link(&self) -> bool {
        self.scalar == ScalarClass::Link
    }

    /// The list-composed counterpart of a scalar attribute, with id `"<id>.list"`.
    pub fn list_variant(&self) -> Attribute {
        self.variant(Composition::List, "list")
    }
    /// The set-composed counterpart of a scalar attribute, with id `"<id>.set"`.
    pub fn set_variant(&self) -> Attribute {
        self.variant(Composition::Set, "set")
    }
    fn variant(&self, composition: Composition, suffix: &str) -> Attribute {
        assert_eq!(
            self.composition,
            Composition::Scalar,
            "only scalar attributes have {} variants ({})",
            suffix,
            self.id
        );
        Attribute::new(
            &format!("{}.{}", self.id, suffix),
            &format!("{} ({})", self.name, suffix),
            self.scalar,
            composition,
            self.propagating,
        )
    }

    /// Same id and shape. The display name is not compared.
    pub fn same_shape(&self, other: &Attribute) -> bool {
        self == other
    }

    /// Whether a value may be stored under this attribute. Empty collections
    /// are always accepted since they clear the value.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_empty() {
            return true;
        }
        if value.composition() != self.composition {
            return false;
        }
        value
            .elements()
            .iter()
            .all(|e| e.composition() == Composition::Scalar && e.scalar_class() == Some(self.scalar))
    }

    /// Compares two stored values the way this attribute sees them: empty
    /// collections equal absence, sets compare regardless of order.
    pub fn is_equal_value(&self, a: Option<&Value>, b: Option<&Value>) -> bool {
        let a = a.filter(|v| !v.is_empty());
        let b = b.filter(|v| !v.is_empty());
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// The logical identity of the item that describes this attribute.
    pub fn descriptor(&self) -> IdentifiedObject {
        ATTRIBUTE_TYPE.instance(&self.id, &self.name)
    }

    fn key(&self) -> (&str, ScalarClass, Composition, bool) {
        (&self.id, self.scalar, self.composition, self.propagating)
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for Attribute {}
impl Ord for Attribute {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}
impl PartialOrd for Attribute {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Hash for Attribute {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}::<{}", self.id, self.scalar)?;
        match self.composition {
            Composition::Scalar => write!(f, ">"),
            other => write!(f, " {}>", other),
        }
    }
}

// ------------- System attributes -------------
lazy_static! {
    /// Logical identity of a materialized item.
    pub static ref ID: Attribute = Attribute::string("sys:id", "ID");
    pub static ref NAME: Attribute = Attribute::string("sys:name", "Name");
    /// The item type of a materialized item.
    pub static ref TYPE: Attribute = Attribute::link("sys:type", "Type", false);
    pub static ref SCALAR_CLASS: Attribute = Attribute::string("sys:attribute:scalar", "Scalar class");
    pub static ref COMPOSITION: Attribute = Attribute::string("sys:attribute:composition", "Composition");
    pub static ref PROPAGATING: Attribute = Attribute::bool("sys:attribute:propagating", "Propagating change");
}

pub fn system_attributes() -> Vec<Attribute> {
    vec![
        ID.clone(),
        NAME.clone(),
        TYPE.clone(),
        SCALAR_CLASS.clone(),
        COMPOSITION.clone(),
        PROPAGATING.clone(),
    ]
}
