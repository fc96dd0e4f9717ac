use std::sync::Arc;

// other keepers use HashMap
use core::hash::{BuildHasherDefault, Hash, Hasher};
use seahash::SeaHasher;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

// used to print out readable forms of a construct
use std::fmt;

use lazy_static::lazy_static;

use crate::attribute::Attribute;

// ------------- Item -------------
pub type Item = u64;

pub type ItemHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

/// The null reference. No item is ever allocated with this id.
pub const NULL_ITEM: Item = 0;

/// Internal change number, one per committed write transaction.
pub type Icn = u64;

/// Hands out item ids. Ids are never reused, also not after an item has
/// been cleared or purged.
#[derive(Debug, Default, Clone)]
pub struct ItemGenerator {
    lower_bound: Item,
}

impl ItemGenerator {
    pub fn new() -> Self {
        Self {
            lower_bound: NULL_ITEM,
        }
    }
    // The retain function is necessary when restoring an existing
    // persisted database, so that new ids start above anything seen.
    pub fn retain(&mut self, item: Item) {
        if item > self.lower_bound {
            self.lower_bound = item;
        }
    }
    pub fn generate(&mut self) -> Item {
        self.lower_bound += 1;
        self.lower_bound
    }
    pub fn last(&self) -> Item {
        self.lower_bound
    }
}

// ------------- Identified objects -------------
pub const ITEM_TYPE_ID: &str = "sys:itemType";

/// A logical identity: a string key that maps to exactly one item once
/// it has been materialized.
#[derive(Clone, Debug)]
pub struct IdentifiedObject {
    id: Arc<str>,
    name: Option<Arc<str>>,
    kind: Option<Arc<str>>,
}

impl IdentifiedObject {
    pub fn new(id: &str) -> Self {
        assert!(!id.is_empty(), "identity must not be empty");
        Self {
            id: Arc::from(id),
            name: None,
            kind: None,
        }
    }
    pub fn named(id: &str, name: &str) -> Self {
        Self {
            name: Some(Arc::from(name)),
            ..Self::new(id)
        }
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn key(&self) -> Arc<str> {
        Arc::clone(&self.id)
    }
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    /// The identity of the item type this object is an instance of.
    pub fn kind(&self) -> Option<IdentifiedObject> {
        self.kind.as_ref().map(|kind| IdentifiedObject {
            id: Arc::clone(kind),
            name: None,
            kind: Some(Arc::from(ITEM_TYPE_ID)),
        })
    }
}

// identities are equal by key alone
impl PartialEq for IdentifiedObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for IdentifiedObject {}
impl Hash for IdentifiedObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl fmt::Display for IdentifiedObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "<{}:{}>", self.id, name),
            None => write!(f, "<{}>", self.id),
        }
    }
}

// ------------- Item types -------------
/// An identified object describing a class of items. Materializing an
/// instance also materializes its type and links the two through `TYPE`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ItemType {
    object: IdentifiedObject,
}

impl ItemType {
    pub fn new(id: &str, name: &str) -> Self {
        let mut object = IdentifiedObject::named(id, name);
        object.kind = Some(Arc::from(ITEM_TYPE_ID));
        Self { object }
    }
    pub fn object(&self) -> &IdentifiedObject {
        &self.object
    }
    pub fn id(&self) -> &str {
        self.object.id()
    }
    pub fn instance(&self, id: &str, name: &str) -> IdentifiedObject {
        let mut object = IdentifiedObject::named(id, name);
        object.kind = Some(self.object.key());
        object
    }
}

lazy_static! {
    pub static ref ITEM_TYPE: ItemType = ItemType::new(ITEM_TYPE_ID, "Item type");
    pub static ref ATTRIBUTE_TYPE: ItemType = ItemType::new("sys:attribute", "Attribute");
}

// ------------- Attribute catalog -------------
#[derive(Debug, Default, Clone)]
pub struct AttributeKeeper {
    kept: HashMap<Arc<str>, Attribute, OtherHasher>,
}

impl AttributeKeeper {
    pub fn new() -> Self {
        Self {
            kept: HashMap::default(),
        }
    }
    /// Returns the kept descriptor and whether it was kept before. Keeping
    /// a different shape under an existing id is a programming error.
    pub fn keep(&mut self, attribute: Attribute) -> (Attribute, bool) {
        match self.kept.entry(Arc::from(attribute.id())) {
            Entry::Occupied(e) => {
                assert!(
                    e.get().same_shape(&attribute),
                    "attribute id {} is already used by {}",
                    attribute,
                    e.get()
                );
                (e.get().clone(), true)
            }
            Entry::Vacant(e) => (e.insert(attribute).clone(), false),
        }
    }
    pub fn get(&self, id: &str) -> Option<&Attribute> {
        self.kept.get(id)
    }
    pub fn contains(&self, attribute: &Attribute) -> bool {
        self.kept.contains_key(attribute.id())
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.kept.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_never_reuses_ids() {
        let mut generator = ItemGenerator::new();
        let a = generator.generate();
        generator.retain(10);
        let b = generator.generate();
        generator.retain(3);
        let c = generator.generate();
        assert_eq!((a, b, c), (1, 11, 12));
    }

    #[test]
    fn keeper_reports_previously_kept() {
        let mut keeper = AttributeKeeper::new();
        let (_, before) = keeper.keep(Attribute::long("test:a", "A"));
        let (kept, again) = keeper.keep(Attribute::long("test:a", "renamed"));
        assert!(!before);
        assert!(again);
        assert_eq!(kept.name(), "A");
        assert_eq!(keeper.len(), 1);
    }

    #[test]
    #[should_panic]
    fn keeper_refuses_conflicting_shapes() {
        let mut keeper = AttributeKeeper::new();
        keeper.keep(Attribute::long("test:a", "A"));
        keeper.keep(Attribute::string("test:a", "A"));
    }

    #[test]
    fn instances_know_their_type() {
        let bug = ItemType::new("test:bug", "Bug");
        let b1 = bug.instance("test:bug:1", "First bug");
        assert_eq!(b1.kind(), Some(bug.object().clone()));
        assert_eq!(bug.object().kind().map(|k| k.key()), Some(Arc::from(ITEM_TYPE_ID)));
    }
}
