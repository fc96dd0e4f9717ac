//! The in-memory snapshot and the write overlay staged on top of it.
//!
//! [`Store`] holds the committed state together with the indexes the query
//! evaluator works on. A write transaction never touches it directly: its
//! changes collect in an [`Overlay`] and are read back through [`Staged`],
//! which layers the overlay over the snapshot. Readers keep using the
//! snapshot until the writer applies the overlay at commit.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

// used to keep the one-to-one mapping between identities and their items
use bimap::BiMap;
// since every item is a u64 we can use bitsets to "join" them
use roaring::RoaringTreemap;

use crate::attribute::Attribute;
use crate::construct::{AttributeKeeper, Icn, Item, ItemGenerator, ItemHasher, OtherHasher, NULL_ITEM};
use crate::datatype::Value;

pub type ElementRange<'v> = (Bound<&'v Value>, Bound<&'v Value>);

/// Read access shared by the committed snapshot and a staged transaction.
pub trait StoreView {
    fn value(&self, item: Item, attribute: &Attribute) -> Option<&Value>;
    fn row(&self, item: Item) -> Vec<(Attribute, Value)>;
    /// Items having any value for the attribute.
    fn column(&self, attribute: &Attribute) -> Cow<'_, RoaringTreemap>;
    /// Items whose value is, or contains, the element.
    fn items_with(&self, attribute: &Attribute, element: &Value) -> Cow<'_, RoaringTreemap>;
    /// Items with an element inside `range` that also passes `accept`.
    fn items_where(
        &self,
        attribute: &Attribute,
        range: ElementRange<'_>,
        accept: &dyn Fn(&Value) -> bool,
    ) -> RoaringTreemap;
    fn alive(&self) -> Cow<'_, RoaringTreemap>;
    fn is_alive(&self, item: Item) -> bool;
    /// The item currently materialized for an identity, or `NULL_ITEM`.
    fn identity(&self, key: &str) -> Item;
    fn identity_of(&self, item: Item) -> Option<Arc<str>>;
    fn icn(&self) -> Icn;
    fn attribute(&self, id: &str) -> Option<Attribute>;
    fn changed_since(&self, icn: Icn) -> Vec<Item>;
}

// ------------- Store -------------
#[derive(Debug, Default)]
pub struct Store {
    rows: HashMap<Item, BTreeMap<Attribute, Value>, ItemHasher>,
    columns: HashMap<Attribute, RoaringTreemap, OtherHasher>,
    // element -> items, ordered so comparisons can scan a range
    elements: HashMap<Attribute, BTreeMap<Value, RoaringTreemap>, OtherHasher>,
    alive: RoaringTreemap,
    identities: BiMap<Arc<str>, Item>,
    generator: ItemGenerator,
    last_icn: HashMap<Item, Icn, ItemHasher>,
    catalog: AttributeKeeper,
    icn: Icn,
}

/// What a commit changed, in the terms change notification needs.
#[derive(Debug, Default)]
pub struct Applied {
    pub changed: Vec<Item>,
    pub identities: Vec<Arc<str>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn last_item(&self) -> Item {
        self.generator.last()
    }
    pub fn catalog(&self) -> &AttributeKeeper {
        &self.catalog
    }
    pub fn alive_count(&self) -> u64 {
        self.alive.len()
    }
    pub fn alive_items(&self) -> impl Iterator<Item = Item> + '_ {
        self.alive.iter()
    }
    /// Cleared items whose last change happened before `icn`.
    pub fn dead_items_before(&self, icn: Icn) -> Vec<Item> {
        let mut items: Vec<Item> = self
            .last_icn
            .iter()
            .filter(|&(item, changed)| *changed < icn && !self.alive.contains(*item))
            .map(|(item, _)| *item)
            .collect();
        items.sort_unstable();
        items
    }

    pub(crate) fn put_value(&mut self, item: Item, attribute: &Attribute, value: Option<Value>) {
        let row = self.rows.entry(item).or_default();
        let old = match &value {
            Some(v) => row.insert(attribute.clone(), v.clone()),
            None => row.remove(attribute),
        };
        if row.is_empty() {
            self.rows.remove(&item);
        }
        if let Some(old) = old {
            if let Some(index) = self.elements.get_mut(attribute) {
                for element in old.elements() {
                    if let Some(items) = index.get_mut(element) {
                        items.remove(item);
                        if items.is_empty() {
                            index.remove(element);
                        }
                    }
                }
            }
        }
        match value {
            Some(v) => {
                self.columns.entry(attribute.clone()).or_default().insert(item);
                let index = self.elements.entry(attribute.clone()).or_default();
                for element in v.elements() {
                    index.entry(element.clone()).or_default().insert(item);
                }
            }
            None => {
                if let Some(column) = self.columns.get_mut(attribute) {
                    column.remove(item);
                }
            }
        }
    }
    pub(crate) fn set_alive(&mut self, item: Item, alive: bool) {
        if alive {
            self.alive.insert(item);
        } else {
            self.alive.remove(item);
        }
        self.generator.retain(item);
    }
    pub(crate) fn bind_identity(&mut self, key: Arc<str>, item: Item) {
        if item == NULL_ITEM {
            self.identities.remove_by_left(&key);
        } else {
            self.identities.insert(key, item);
        }
    }
    pub(crate) fn keep_attribute(&mut self, attribute: Attribute) {
        self.catalog.keep(attribute);
    }
    pub(crate) fn touch(&mut self, item: Item, icn: Icn) {
        self.last_icn.insert(item, icn);
    }
    pub(crate) fn restore_counters(&mut self, icn: Icn, last_item: Item) {
        self.icn = icn;
        self.generator.retain(last_item);
    }
    pub(crate) fn forget(&mut self, items: &[Item]) {
        for item in items {
            self.last_icn.remove(item);
        }
    }

    /// Applies a staged overlay as the commit with the given ICN.
    pub(crate) fn apply(&mut self, overlay: Overlay, icn: Icn) -> Applied {
        let Overlay {
            values,
            alive,
            identities,
            attributes,
            changed,
            generator,
            ..
        } = overlay;
        for attribute in attributes {
            self.keep_attribute(attribute);
        }
        for (item, row) in values {
            for (attribute, value) in row {
                self.put_value(item, &attribute, value);
            }
        }
        for (item, alive) in alive {
            self.set_alive(item, alive);
        }
        let mut changed_identities = Vec::with_capacity(identities.len());
        for (key, item) in identities {
            changed_identities.push(Arc::clone(&key));
            self.bind_identity(key, item);
        }
        self.generator.retain(generator.last());
        for &item in &changed {
            self.touch(item, icn);
        }
        self.icn = icn;
        Applied {
            changed: changed.into_iter().collect(),
            identities: changed_identities,
        }
    }
}

impl StoreView for Store {
    fn value(&self, item: Item, attribute: &Attribute) -> Option<&Value> {
        self.rows.get(&item).and_then(|row| row.get(attribute))
    }
    fn row(&self, item: Item) -> Vec<(Attribute, Value)> {
        self.rows
            .get(&item)
            .map(|row| row.iter().map(|(a, v)| (a.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
    fn column(&self, attribute: &Attribute) -> Cow<'_, RoaringTreemap> {
        match self.columns.get(attribute) {
            Some(column) => Cow::Borrowed(column),
            None => Cow::Owned(RoaringTreemap::new()),
        }
    }
    fn items_with(&self, attribute: &Attribute, element: &Value) -> Cow<'_, RoaringTreemap> {
        match self.elements.get(attribute).and_then(|index| index.get(element)) {
            Some(items) => Cow::Borrowed(items),
            None => Cow::Owned(RoaringTreemap::new()),
        }
    }
    fn items_where(
        &self,
        attribute: &Attribute,
        range: ElementRange<'_>,
        accept: &dyn Fn(&Value) -> bool,
    ) -> RoaringTreemap {
        let mut result = RoaringTreemap::new();
        if let Some(index) = self.elements.get(attribute) {
            for (element, items) in index.range::<Value, _>(range) {
                if accept(element) {
                    result |= items;
                }
            }
        }
        result
    }
    fn alive(&self) -> Cow<'_, RoaringTreemap> {
        Cow::Borrowed(&self.alive)
    }
    fn is_alive(&self, item: Item) -> bool {
        self.alive.contains(item)
    }
    fn identity(&self, key: &str) -> Item {
        self.identities
            .get_by_left(key)
            .copied()
            .filter(|item| self.alive.contains(*item))
            .unwrap_or(NULL_ITEM)
    }
    fn identity_of(&self, item: Item) -> Option<Arc<str>> {
        self.identities.get_by_right(&item).cloned()
    }
    fn icn(&self) -> Icn {
        self.icn
    }
    fn attribute(&self, id: &str) -> Option<Attribute> {
        self.catalog.get(id).cloned()
    }
    fn changed_since(&self, icn: Icn) -> Vec<Item> {
        let mut items: Vec<Item> = self
            .last_icn
            .iter()
            .filter(|&(_, changed)| *changed >= icn)
            .map(|(item, _)| *item)
            .collect();
        items.sort_unstable();
        items
    }
}

// ------------- Overlay -------------
/// Changes of one write transaction that have not been applied yet.
#[derive(Debug, Default)]
pub struct Overlay {
    values: HashMap<Item, BTreeMap<Attribute, Option<Value>>, ItemHasher>,
    by_attribute: HashMap<Attribute, BTreeSet<Item>, OtherHasher>,
    alive: BTreeMap<Item, bool>,
    // NULL_ITEM marks a removed mapping
    identities: BTreeMap<Arc<str>, Item>,
    attributes: Vec<Attribute>,
    changed: BTreeSet<Item>,
    // continues from the snapshot's generator
    generator: ItemGenerator,
}

impl Overlay {
    fn pending(&self, item: Item, attribute: &Attribute) -> Option<Option<&Value>> {
        self.values
            .get(&item)
            .and_then(|row| row.get(attribute))
            .map(|v| v.as_ref())
    }
    pub fn values(&self) -> impl Iterator<Item = (Item, &Attribute, Option<&Value>)> {
        self.values
            .iter()
            .flat_map(|(item, row)| row.iter().map(move |(a, v)| (*item, a, v.as_ref())))
    }
    pub fn alive_changes(&self) -> impl Iterator<Item = (Item, bool)> + '_ {
        self.alive.iter().map(|(item, alive)| (*item, *alive))
    }
    pub fn identity_changes(&self) -> impl Iterator<Item = (&str, Item)> {
        self.identities.iter().map(|(key, item)| (key.as_ref(), *item))
    }
    pub fn new_attributes(&self) -> &[Attribute] {
        &self.attributes
    }
    pub fn changed(&self) -> &BTreeSet<Item> {
        &self.changed
    }
    pub fn last_item(&self) -> Item {
        self.generator.last()
    }
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.identities.is_empty() && self.attributes.is_empty()
    }
}

// ------------- Staged -------------
/// A write transaction's view: the overlay layered over the snapshot.
pub struct Staged<'s> {
    store: &'s Store,
    overlay: Overlay,
}

impl<'s> Staged<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self {
            store,
            overlay: Overlay {
                generator: store.generator.clone(),
                ..Overlay::default()
            },
        }
    }
    pub fn store(&self) -> &'s Store {
        self.store
    }
    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }
    pub fn into_overlay(self) -> Overlay {
        self.overlay
    }
    pub fn changed(&self) -> &BTreeSet<Item> {
        &self.overlay.changed
    }

    /// Records a value; `None` removes it. Returns the previous value.
    pub fn record(&mut self, item: Item, attribute: &Attribute, value: Option<Value>) -> Option<Value> {
        let previous = self.value(item, attribute).cloned();
        if attribute.is_equal_value(previous.as_ref(), value.as_ref()) {
            return previous;
        }
        let value = value.filter(|v| !v.is_empty());
        if value.is_some() && !self.is_alive(item) {
            self.overlay.alive.insert(item, true);
        }
        self.overlay
            .values
            .entry(item)
            .or_default()
            .insert(attribute.clone(), value);
        self.overlay
            .by_attribute
            .entry(attribute.clone())
            .or_default()
            .insert(item);
        self.overlay.changed.insert(item);
        previous
    }
    pub fn allocate(&mut self) -> Item {
        let item = self.overlay.generator.generate();
        self.overlay.alive.insert(item, true);
        self.overlay.changed.insert(item);
        item
    }
    /// Marks the item dead. Its values must have been removed already.
    pub fn kill(&mut self, item: Item) {
        self.overlay.alive.insert(item, false);
        self.overlay.changed.insert(item);
    }
    pub fn mark_changed(&mut self, item: Item) -> bool {
        self.overlay.changed.insert(item)
    }
    pub fn bind_identity(&mut self, key: Arc<str>, item: Item) {
        self.overlay.identities.insert(key, item);
    }
    /// Adds an attribute to the catalog. Returns false when it was known.
    pub fn keep_attribute(&mut self, attribute: &Attribute) -> bool {
        if let Some(known) = self.attribute(attribute.id()) {
            assert!(
                known.same_shape(attribute),
                "attribute id {} is already used by {}",
                attribute,
                known
            );
            return false;
        }
        self.overlay.attributes.push(attribute.clone());
        true
    }
}

impl StoreView for Staged<'_> {
    fn value(&self, item: Item, attribute: &Attribute) -> Option<&Value> {
        match self.overlay.pending(item, attribute) {
            Some(pending) => pending,
            None => self.store.value(item, attribute),
        }
    }
    fn row(&self, item: Item) -> Vec<(Attribute, Value)> {
        let Some(pending) = self.overlay.values.get(&item) else {
            return self.store.row(item);
        };
        let mut row: BTreeMap<Attribute, Value> = self.store.row(item).into_iter().collect();
        for (attribute, value) in pending {
            match value {
                Some(v) => row.insert(attribute.clone(), v.clone()),
                None => row.remove(attribute),
            };
        }
        row.into_iter().collect()
    }
    fn column(&self, attribute: &Attribute) -> Cow<'_, RoaringTreemap> {
        let base = self.store.column(attribute);
        let Some(touched) = self.overlay.by_attribute.get(attribute) else {
            return base;
        };
        let mut column = base.into_owned();
        for &item in touched {
            match self.overlay.pending(item, attribute) {
                Some(Some(_)) => column.insert(item),
                _ => column.remove(item),
            };
        }
        Cow::Owned(column)
    }
    fn items_with(&self, attribute: &Attribute, element: &Value) -> Cow<'_, RoaringTreemap> {
        let base = self.store.items_with(attribute, element);
        let Some(touched) = self.overlay.by_attribute.get(attribute) else {
            return base;
        };
        let mut items = base.into_owned();
        for &item in touched {
            match self.overlay.pending(item, attribute) {
                Some(Some(v)) if v.contains_element(element) => items.insert(item),
                _ => items.remove(item),
            };
        }
        Cow::Owned(items)
    }
    fn items_where(
        &self,
        attribute: &Attribute,
        range: ElementRange<'_>,
        accept: &dyn Fn(&Value) -> bool,
    ) -> RoaringTreemap {
        let mut items = self.store.items_where(attribute, range, accept);
        if let Some(touched) = self.overlay.by_attribute.get(attribute) {
            for &item in touched {
                match self.overlay.pending(item, attribute) {
                    Some(Some(v)) if v.elements().into_iter().any(|e| accept(e)) => items.insert(item),
                    _ => items.remove(item),
                };
            }
        }
        items
    }
    fn alive(&self) -> Cow<'_, RoaringTreemap> {
        let base = self.store.alive();
        if self.overlay.alive.is_empty() {
            return base;
        }
        let mut alive = base.into_owned();
        for (&item, &is_alive) in &self.overlay.alive {
            if is_alive {
                alive.insert(item);
            } else {
                alive.remove(item);
            }
        }
        Cow::Owned(alive)
    }
    fn is_alive(&self, item: Item) -> bool {
        match self.overlay.alive.get(&item) {
            Some(alive) => *alive,
            None => self.store.is_alive(item),
        }
    }
    fn identity(&self, key: &str) -> Item {
        match self.overlay.identities.get(key) {
            Some(&item) if item != NULL_ITEM && self.is_alive(item) => item,
            Some(_) => NULL_ITEM,
            None => {
                let item = self.store.identity(key);
                if item != NULL_ITEM && self.is_alive(item) { item } else { NULL_ITEM }
            }
        }
    }
    fn identity_of(&self, item: Item) -> Option<Arc<str>> {
        if let Some((key, _)) = self.overlay.identities.iter().find(|(_, i)| **i == item) {
            return Some(Arc::clone(key));
        }
        self.store
            .identity_of(item)
            .filter(|key| !self.overlay.identities.contains_key(key))
    }
    fn icn(&self) -> Icn {
        self.store.icn()
    }
    fn attribute(&self, id: &str) -> Option<Attribute> {
        self.overlay
            .attributes
            .iter()
            .find(|a| a.id() == id)
            .cloned()
            .or_else(|| self.store.attribute(id))
    }
    fn changed_since(&self, icn: Icn) -> Vec<Item> {
        let mut items = self.store.changed_since(icn);
        if self.store.icn() + 1 >= icn {
            items.extend(self.overlay.changed.iter().copied());
            items.sort_unstable();
            items.dedup();
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Attribute {
        Attribute::set("test:tags", "Tags", crate::datatype::ScalarClass::Text)
    }

    #[test]
    fn elements_of_collections_are_indexed() {
        let mut store = Store::new();
        store.put_value(1, &tags(), Some(Value::set([Value::from("a"), Value::from("b")])));
        store.put_value(2, &tags(), Some(Value::set([Value::from("b")])));
        assert_eq!(store.items_with(&tags(), &Value::from("b")).len(), 2);
        store.put_value(1, &tags(), Some(Value::set([Value::from("c")])));
        assert_eq!(store.items_with(&tags(), &Value::from("b")).iter().collect::<Vec<_>>(), vec![2]);
        assert!(store.items_with(&tags(), &Value::from("a")).is_empty());
        store.put_value(2, &tags(), None);
        assert_eq!(store.column(&tags()).iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn staged_changes_stay_out_of_the_snapshot() {
        let mut store = Store::new();
        store.set_alive(1, true);
        store.put_value(1, &tags(), Some(Value::set([Value::from("a")])));
        let mut staged = Staged::new(&store);
        let item = staged.allocate();
        assert_eq!(item, 2);
        staged.record(item, &tags(), Some(Value::set([Value::from("a")])));
        staged.record(1, &tags(), None);
        assert_eq!(staged.items_with(&tags(), &Value::from("a")).iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(store.items_with(&tags(), &Value::from("a")).iter().collect::<Vec<_>>(), vec![1]);
        let overlay = staged.into_overlay();
        let applied = store.apply(overlay, 1);
        assert_eq!(applied.changed, vec![1, 2]);
        assert_eq!(store.items_with(&tags(), &Value::from("a")).iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(store.icn(), 1);
        assert_eq!(store.changed_since(1), vec![1, 2]);
    }

    #[test]
    fn unchanged_values_are_not_recorded() {
        let mut store = Store::new();
        store.set_alive(1, true);
        store.put_value(1, &tags(), Some(Value::set([Value::from("a")])));
        let mut staged = Staged::new(&store);
        staged.record(1, &tags(), Some(Value::set([Value::from("a")])));
        assert!(staged.changed().is_empty());
    }
}
