// used for decimal numbers
use bigdecimal::BigDecimal;
// used for timestamps in the database
use chrono::{DateTime, Utc};
// values are persisted as JSON text
use serde::{Deserialize, Serialize};

// collections have a natural ordering, which keeps stored values canonical
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
// used to print out readable forms of a value
use std::fmt;

use crate::attribute::Attribute;
use crate::construct::Item;

// ------------- Scalar classes -------------
/// The scalar type an attribute holds, either directly or as the elements
/// of a list or set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScalarClass {
    Long,
    Int,
    Bool,
    Text,
    Bytes,
    Decimal,
    Date,
    Link,
    Map,
}

impl ScalarClass {
    pub const ALL: [ScalarClass; 9] = [
        ScalarClass::Long,
        ScalarClass::Int,
        ScalarClass::Bool,
        ScalarClass::Text,
        ScalarClass::Bytes,
        ScalarClass::Decimal,
        ScalarClass::Date,
        ScalarClass::Link,
        ScalarClass::Map,
    ];
    pub fn identifier(&self) -> u8 {
        match self {
            ScalarClass::Long => 1,
            ScalarClass::Int => 2,
            ScalarClass::Bool => 3,
            ScalarClass::Text => 4,
            ScalarClass::Bytes => 5,
            ScalarClass::Decimal => 6,
            ScalarClass::Date => 7,
            ScalarClass::Link => 8,
            ScalarClass::Map => 9,
        }
    }
    pub fn data_type(&self) -> &'static str {
        match self {
            ScalarClass::Long => "Long",
            ScalarClass::Int => "Int",
            ScalarClass::Bool => "Bool",
            ScalarClass::Text => "Text",
            ScalarClass::Bytes => "Bytes",
            ScalarClass::Decimal => "Decimal",
            ScalarClass::Date => "Date",
            ScalarClass::Link => "Link",
            ScalarClass::Map => "Map",
        }
    }
    pub fn from_identifier(uid: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.identifier() == uid)
    }
    pub fn from_data_type(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.data_type() == name)
    }
}

impl fmt::Display for ScalarClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.data_type())
    }
}

// ------------- Composition -------------
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Composition {
    Scalar,
    List,
    Set,
}

impl Composition {
    pub fn name(&self) -> &'static str {
        match self {
            Composition::Scalar => "Scalar",
            Composition::List => "List",
            Composition::Set => "Set",
        }
    }
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Scalar" => Some(Composition::Scalar),
            "List" => Some(Composition::List),
            "Set" => Some(Composition::Set),
            _ => None,
        }
    }
}

impl fmt::Display for Composition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ------------- Value -------------
/// A stored attribute value. Lists keep insertion order, sets are kept sorted
/// so that two equal sets always compare and hash equal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Long(i64),
    Int(i32),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    Decimal(BigDecimal),
    Date(DateTime<Utc>),
    Item(Item),
    Map(AttributeMap),
    List(Vec<Value>),
    Set(BTreeSet<Value>),
}

impl Value {
    /// The scalar class of this value, or of its elements for lists and sets.
    /// Empty collections have no class.
    pub fn scalar_class(&self) -> Option<ScalarClass> {
        match self {
            Value::Long(_) => Some(ScalarClass::Long),
            Value::Int(_) => Some(ScalarClass::Int),
            Value::Bool(_) => Some(ScalarClass::Bool),
            Value::Text(_) => Some(ScalarClass::Text),
            Value::Bytes(_) => Some(ScalarClass::Bytes),
            Value::Decimal(_) => Some(ScalarClass::Decimal),
            Value::Date(_) => Some(ScalarClass::Date),
            Value::Item(_) => Some(ScalarClass::Link),
            Value::Map(_) => Some(ScalarClass::Map),
            Value::List(list) => list.first().and_then(|v| v.scalar_class()),
            Value::Set(set) => set.first().and_then(|v| v.scalar_class()),
        }
    }
    pub fn composition(&self) -> Composition {
        match self {
            Value::List(_) => Composition::List,
            Value::Set(_) => Composition::Set,
            _ => Composition::Scalar,
        }
    }
    /// Empty collections are treated as the absence of a value.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::List(list) => list.is_empty(),
            Value::Set(set) => set.is_empty(),
            Value::Map(map) => map.is_empty(),
            _ => false,
        }
    }
    /// The individually indexed parts of a value: the elements of a list or
    /// set, otherwise the value itself.
    pub fn elements(&self) -> Vec<&Value> {
        match self {
            Value::List(list) => list.iter().collect(),
            Value::Set(set) => set.iter().collect(),
            other => vec![other],
        }
    }
    pub fn contains_element(&self, element: &Value) -> bool {
        match self {
            Value::List(list) => list.contains(element),
            Value::Set(set) => set.contains(element),
            other => other == element,
        }
    }
    /// Every item referenced by this value, including through nested maps.
    pub fn referenced_items(&self) -> Vec<Item> {
        let mut items = Vec::new();
        self.collect_items(&mut items);
        items
    }
    fn collect_items(&self, items: &mut Vec<Item>) {
        match self {
            Value::Item(item) if *item != 0 => items.push(*item),
            Value::List(list) => list.iter().for_each(|v| v.collect_items(items)),
            Value::Set(set) => set.iter().for_each(|v| v.collect_items(items)),
            Value::Map(map) => map.values().for_each(|v| v.collect_items(items)),
            _ => (),
        }
    }
    pub fn same_kind(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
    pub fn get<T: DataType>(&self) -> Option<T> {
        T::from_value(self)
    }
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            Value::Int(v) => Some(i64::from(*v)),
            _ => None,
        }
    }
    pub fn as_item(&self) -> Option<Item> {
        match self {
            Value::Item(v) => Some(*v),
            _ => None,
        }
    }
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
    pub fn list<I: IntoIterator<Item = Value>>(values: I) -> Value {
        Value::List(values.into_iter().collect())
    }
    pub fn set<I: IntoIterator<Item = Value>>(values: I) -> Value {
        Value::Set(values.into_iter().collect())
    }
    pub fn items<I: IntoIterator<Item = Item>>(items: I) -> Value {
        Value::Set(items.into_iter().map(Value::Item).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Long(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "\"{}\"", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "'{}'", v.to_rfc3339()),
            Value::Item(v) => write!(f, "#{}", v),
            Value::Map(map) => write!(f, "{}", map),
            Value::List(list) => {
                let parts: Vec<String> = list.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Set(set) => {
                let parts: Vec<String> = set.iter().map(|v| v.to_string()).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

// ------------- Data Types --------------
/// Native Rust types that map onto a scalar class.
pub trait DataType: Sized {
    const UID: u8;
    const DATA_TYPE: &'static str;
    fn into_value(self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
    fn scalar_class() -> ScalarClass {
        ScalarClass::from_identifier(Self::UID).unwrap_or(ScalarClass::Map)
    }
}

macro_rules! data_type {
    ($t:ty, $variant:ident, $class:expr) => {
        impl DataType for $t {
            const UID: u8 = $class;
            const DATA_TYPE: &'static str = stringify!($variant);
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        }
    };
}

data_type!(i64, Long, 1);
data_type!(i32, Int, 2);
data_type!(bool, Bool, 3);
data_type!(String, Text, 4);
data_type!(Vec<u8>, Bytes, 5);
data_type!(BigDecimal, Decimal, 6);
data_type!(DateTime<Utc>, Date, 7);
data_type!(Item, Item, 8);
data_type!(AttributeMap, Map, 9);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

// ------------- AttributeMap -------------
/// An ordered `Attribute -> Value` mapping. Used as the value of a composite
/// attribute and for bulk reads and writes of an item.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<(Attribute, Value)>", into = "Vec<(Attribute, Value)>")]
pub struct AttributeMap {
    values: BTreeMap<Attribute, Value>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }
    /// Sets or, with an empty value, removes the value of an attribute.
    pub fn insert(&mut self, attribute: Attribute, value: Value) {
        assert!(
            attribute.accepts(&value),
            "value {} does not fit attribute {}",
            value,
            attribute
        );
        if value.is_empty() {
            self.values.remove(&attribute);
        } else {
            self.values.insert(attribute, value);
        }
    }
    pub fn with(mut self, attribute: &Attribute, value: impl Into<Value>) -> Self {
        self.insert(attribute.clone(), value.into());
        self
    }
    pub fn remove(&mut self, attribute: &Attribute) -> Option<Value> {
        self.values.remove(attribute)
    }
    pub fn get(&self, attribute: &Attribute) -> Option<&Value> {
        self.values.get(attribute)
    }
    pub fn contains(&self, attribute: &Attribute) -> bool {
        self.values.contains_key(attribute)
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    pub fn iter(&self) -> btree_map::Iter<'_, Attribute, Value> {
        self.values.iter()
    }
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.values.keys()
    }
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.values()
    }
}

impl From<Vec<(Attribute, Value)>> for AttributeMap {
    fn from(pairs: Vec<(Attribute, Value)>) -> Self {
        Self {
            values: pairs.into_iter().filter(|(_, v)| !v.is_empty()).collect(),
        }
    }
}
impl From<AttributeMap> for Vec<(Attribute, Value)> {
    fn from(map: AttributeMap) -> Self {
        map.values.into_iter().collect()
    }
}
impl<'a> IntoIterator for &'a AttributeMap {
    type Item = (&'a Attribute, &'a Value);
    type IntoIter = btree_map::Iter<'a, Attribute, Value>;
    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl fmt::Display for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(a, v)| format!("{}: {}", a.name(), v))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
