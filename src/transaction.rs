//! Reader and writer handles passed to transaction bodies.
//!
//! A read transaction gets a [`SnapshotReader`] over the committed store. A
//! write transaction gets a [`TransactionWriter`] whose changes stay in an
//! overlay until the engine commits them; dropping the writer without
//! committing discards everything it did.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};

use tracing::trace;

use crate::attribute::{Attribute, COMPOSITION, ID, NAME, PROPAGATING, SCALAR_CLASS, TYPE};
use crate::construct::{IdentifiedObject, Icn, Item, NULL_ITEM};
use crate::datatype::{AttributeMap, DataType, Value};
use crate::error::{DBError, Result};
use crate::predicate::{BoolExpr, DP};
use crate::query::DBQuery;
use crate::store::{Overlay, Staged, Store, StoreView};

// ------------- contracts -------------
/// Read access to one consistent snapshot. A handle is only valid for the
/// duration of the transaction body it was passed to.
pub trait DBReader {
    fn view(&self) -> &dyn StoreView;
    fn query(&self, expr: BoolExpr<DP>) -> DBQuery<'_>;

    fn get_value(&self, item: Item, attribute: &Attribute) -> Option<Value> {
        self.view().value(item, attribute).cloned()
    }
    /// The item materialized for an identity, or `NULL_ITEM`. Never creates.
    fn find_materialized(&self, object: &IdentifiedObject) -> Item {
        self.view().identity(object.id())
    }
    /// ICN of the last commit visible to this handle.
    fn icn(&self) -> Icn {
        self.view().icn()
    }
    /// Sorted items whose last change happened at or after `icn`.
    fn changed_items_since(&self, icn: Icn) -> Vec<Item> {
        self.view().changed_since(icn)
    }
    /// All values of an item as one map.
    fn load_map(&self, item: Item) -> AttributeMap {
        let mut map = AttributeMap::new();
        for (attribute, value) in self.view().row(item) {
            map.insert(attribute, value);
        }
        map
    }
    fn attribute_by_id(&self, id: &str) -> Option<Attribute> {
        self.view().attribute(id)
    }
    fn is_alive(&self, item: Item) -> bool {
        self.view().is_alive(item)
    }
}

impl dyn DBReader + '_ {
    /// Typed read of a scalar value.
    pub fn get<T: DataType>(&self, item: Item, attribute: &Attribute) -> Option<T> {
        self.view().value(item, attribute).and_then(T::from_value)
    }
}

/// Write access inside a write transaction. Reads through a writer see the
/// transaction's own changes.
pub trait DBWriter: DBReader {
    /// Stores a value; an empty collection clears it. Writing to a cleared
    /// item makes it alive again.
    fn set_value(&mut self, item: Item, attribute: &Attribute, value: Value);
    fn clear_value(&mut self, item: Item, attribute: &Attribute);
    fn set_values(&mut self, item: Item, values: &AttributeMap);
    /// Removes every value of the item and forgets its identity, if any.
    fn clear_item(&mut self, item: Item);
    fn next_item(&mut self) -> Item;
    /// The item for an identity, allocating and describing a new one when
    /// no alive item is mapped.
    fn materialize(&mut self, object: &IdentifiedObject) -> Item;
    /// Marks an item changed without changing any value.
    fn item_changed(&mut self, item: Item);
    /// The ICN this transaction commits as.
    fn transaction_icn(&self) -> Icn;
    /// Copies every value except the identity from one item to another.
    fn copy_all(&mut self, from: Item, to: Item);
    fn as_reader(&self) -> &dyn DBReader;
}

impl dyn DBWriter + '_ {
    pub fn get<T: DataType>(&self, item: Item, attribute: &Attribute) -> Option<T> {
        self.view().value(item, attribute).and_then(T::from_value)
    }
    pub fn set<V: Into<Value>>(&mut self, item: Item, attribute: &Attribute, value: V) {
        self.set_value(item, attribute, value.into());
    }
}

// ------------- SnapshotReader -------------
pub struct SnapshotReader<'a> {
    store: &'a Store,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }
}

impl DBReader for SnapshotReader<'_> {
    fn view(&self) -> &dyn StoreView {
        self.store
    }
    fn query(&self, expr: BoolExpr<DP>) -> DBQuery<'_> {
        DBQuery::new(self, expr)
    }
}

// ------------- TransactionWriter -------------
pub struct TransactionWriter<'s> {
    staged: Staged<'s>,
    icn: Icn,
    // items the propagation closure has already been computed for
    propagated: BTreeSet<Item>,
    // items changed since the last call to take_touched
    touched: BTreeSet<Item>,
}

impl<'s> TransactionWriter<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self {
            staged: Staged::new(store),
            icn: store.icn() + 1,
            propagated: BTreeSet::new(),
            touched: BTreeSet::new(),
        }
    }
    pub fn into_overlay(self) -> Overlay {
        self.staged.into_overlay()
    }
    pub(crate) fn overlay(&self) -> &Overlay {
        self.staged.overlay()
    }
    /// Every item changed so far, ascending.
    pub(crate) fn changed_sorted(&self) -> Vec<Item> {
        self.staged.changed().iter().copied().collect()
    }
    pub(crate) fn take_touched(&mut self) -> Vec<Item> {
        std::mem::take(&mut self.touched).into_iter().collect()
    }
    /// Whether any identity mapping used by `expr` changed in this transaction.
    pub(crate) fn identities_changed(&self, expr: &BoolExpr<DP>) -> bool {
        let identities = expr.identities();
        !identities.is_empty()
            && self
                .overlay()
                .identity_changes()
                .any(|(key, _)| identities.iter().any(|o| o.id() == key))
    }

    fn touch(&mut self, item: Item) {
        self.touched.insert(item);
    }

    fn put(&mut self, item: Item, attribute: &Attribute, value: Option<Value>) {
        assert_ne!(item, NULL_ITEM, "cannot write {} of the null item", attribute);
        if let Some(value) = &value {
            assert!(
                attribute.accepts(value),
                "{} does not accept the value {}",
                attribute,
                value
            );
        }
        self.register(attribute);
        let current = self.staged.value(item, attribute);
        if attribute.is_equal_value(current, value.as_ref()) {
            return;
        }
        let previous = self.staged.record(item, attribute, value);
        self.touch(item);
        // the old targets of a propagating link see the link go away
        if attribute.is_propagating() {
            if let Some(previous) = previous {
                for target in previous.referenced_items() {
                    self.staged.mark_changed(target);
                    self.touch(target);
                }
            }
        }
    }

    // The first write through an attribute adds it to the catalog and
    // materializes the item describing it.
    fn register(&mut self, attribute: &Attribute) {
        if !self.staged.keep_attribute(attribute) {
            return;
        }
        trace!(%attribute, "registering attribute");
        let descriptor = self.materialize(&attribute.descriptor());
        self.put(
            descriptor,
            &SCALAR_CLASS,
            Some(Value::from(attribute.scalar_class().data_type())),
        );
        self.put(
            descriptor,
            &COMPOSITION,
            Some(Value::from(attribute.composition().name())),
        );
        self.put(
            descriptor,
            &PROPAGATING,
            Some(Value::Bool(attribute.is_propagating())),
        );
    }

    fn propagating_attributes(&self) -> Vec<Attribute> {
        self.staged
            .store()
            .catalog()
            .iter()
            .chain(self.overlay().new_attributes())
            .filter(|a| a.is_propagating())
            .cloned()
            .collect()
    }

    /// Marks as changed every item reachable from a changed item through
    /// propagating links, to a fixed point. Returns how many were added.
    pub(crate) fn propagate(&mut self) -> usize {
        let links = self.propagating_attributes();
        if links.is_empty() {
            self.propagated.extend(self.staged.changed().iter().copied());
            return 0;
        }
        let mut frontier: Vec<Item> = self
            .staged
            .changed()
            .difference(&self.propagated)
            .copied()
            .collect();
        let mut added = 0;
        while let Some(item) = frontier.pop() {
            self.propagated.insert(item);
            for link in &links {
                let targets = self
                    .staged
                    .value(item, link)
                    .map(|v| v.referenced_items())
                    .unwrap_or_default();
                for target in targets {
                    if self.staged.mark_changed(target) {
                        self.touch(target);
                        added += 1;
                    }
                    if !self.propagated.contains(&target) {
                        frontier.push(target);
                    }
                }
            }
        }
        added
    }
}

impl DBReader for TransactionWriter<'_> {
    fn view(&self) -> &dyn StoreView {
        &self.staged
    }
    fn query(&self, expr: BoolExpr<DP>) -> DBQuery<'_> {
        DBQuery::new(self, expr)
    }
}

impl DBWriter for TransactionWriter<'_> {
    fn set_value(&mut self, item: Item, attribute: &Attribute, value: Value) {
        self.put(item, attribute, Some(value));
    }
    fn clear_value(&mut self, item: Item, attribute: &Attribute) {
        self.put(item, attribute, None);
    }
    fn set_values(&mut self, item: Item, values: &AttributeMap) {
        for (attribute, value) in values {
            self.put(item, attribute, Some(value.clone()));
        }
    }
    fn clear_item(&mut self, item: Item) {
        for (attribute, _) in self.staged.row(item) {
            self.put(item, &attribute, None);
        }
        if let Some(key) = self.staged.identity_of(item) {
            trace!(item, identity = %key, "forgetting identity");
            self.staged.bind_identity(key, NULL_ITEM);
        }
        self.staged.kill(item);
        self.touch(item);
    }
    fn next_item(&mut self) -> Item {
        let item = self.staged.allocate();
        self.touch(item);
        item
    }
    fn materialize(&mut self, object: &IdentifiedObject) -> Item {
        let existing = self.staged.identity(object.id());
        if existing != NULL_ITEM {
            return existing;
        }
        let item = self.next_item();
        // bound first, so a type that is its own kind finds itself
        self.staged.bind_identity(object.key(), item);
        self.put(item, &ID, Some(Value::from(object.id())));
        if let Some(name) = object.name() {
            self.put(item, &NAME, Some(Value::from(name)));
        }
        if let Some(kind) = object.kind() {
            let kind = self.materialize(&kind);
            self.put(item, &TYPE, Some(Value::Item(kind)));
        }
        trace!(item, identity = %object, "materialized");
        item
    }
    fn item_changed(&mut self, item: Item) {
        self.staged.mark_changed(item);
        self.touch(item);
    }
    fn transaction_icn(&self) -> Icn {
        self.icn
    }
    fn copy_all(&mut self, from: Item, to: Item) {
        for (attribute, value) in self.staged.row(from) {
            if attribute != *ID {
                self.put(to, &attribute, Some(value));
            }
        }
    }
    fn as_reader(&self) -> &dyn DBReader {
        self
    }
}

/// Runs a transaction body, turning a panic into a failure.
pub(crate) fn guarded<T>(body: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => Err(DBError::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::construct::ItemType;

    fn parent() -> Attribute {
        Attribute::link("test:parent", "Parent", true)
    }

    #[test]
    fn materialize_is_idempotent_until_cleared() {
        let store = Store::new();
        let bug = ItemType::new("test:bug", "Bug").instance("test:bug:1", "Bug 1");
        let mut writer = TransactionWriter::new(&store);
        let first = writer.materialize(&bug);
        assert_eq!(writer.materialize(&bug), first);
        assert_eq!(writer.find_materialized(&bug), first);
        writer.clear_item(first);
        assert_eq!(writer.find_materialized(&bug), NULL_ITEM);
        let second = writer.materialize(&bug);
        assert_ne!(second, first);
        assert!(!writer.is_alive(first));
    }

    #[test]
    fn first_use_registers_the_attribute() {
        let store = Store::new();
        let mut writer = TransactionWriter::new(&store);
        let item = writer.next_item();
        writer.set_value(item, &parent(), Value::Item(item));
        let known = writer.attribute_by_id("test:parent");
        assert_eq!(known, Some(parent()));
        let descriptor = writer.find_materialized(&parent().descriptor());
        assert_ne!(descriptor, NULL_ITEM);
        assert_eq!(writer.get_value(descriptor, &PROPAGATING), Some(Value::Bool(true)));
    }

    #[test]
    fn changes_propagate_up_links() {
        let mut store = Store::new();
        let (root, child, grandchild) = {
            let mut writer = TransactionWriter::new(&store);
            let root = writer.next_item();
            let child = writer.next_item();
            let grandchild = writer.next_item();
            writer.set_value(child, &parent(), Value::Item(root));
            writer.set_value(grandchild, &parent(), Value::Item(child));
            let overlay = writer.into_overlay();
            store.apply(overlay, 1);
            (root, child, grandchild)
        };
        let mut writer = TransactionWriter::new(&store);
        writer.item_changed(grandchild);
        writer.propagate();
        let changed = writer.changed_sorted();
        assert!(changed.contains(&child));
        assert!(changed.contains(&root));
    }

    #[test]
    fn panics_become_failures() {
        let result: Result<()> = guarded(|| panic!("broken body"));
        assert!(matches!(result, Err(DBError::Failed(m)) if m.contains("broken body")));
    }

    #[test]
    #[should_panic]
    fn mismatched_values_fail_loudly() {
        let store = Store::new();
        let mut writer = TransactionWriter::new(&store);
        let item = writer.next_item();
        writer.set_value(item, &NAME, Value::Long(1));
    }
}
