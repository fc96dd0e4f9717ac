//! Query evaluation.
//!
//! Expressions are evaluated two ways that must always agree: as whole sets
//! over the bitmap indexes ([`evaluate`]), and item by item ([`accepts`]).
//! Full queries use the former; diffs over a transaction's affected items
//! pick whichever is cheaper for the number of candidates.

use std::cell::OnceCell;
use std::ops::Bound;

use roaring::RoaringTreemap;
use tracing::warn;

use crate::attribute::Attribute;
use crate::construct::{Item, NULL_ITEM};
use crate::datatype::{Composition, Value};
use crate::predicate::{BoolExpr, CompareOp, DP};
use crate::store::StoreView;
use crate::transaction::DBReader;

// below this many candidates, checking items one by one beats a full evaluation
const PER_ITEM_LIMIT: usize = 32;

// ------------- DBQuery -------------
/// A predicate bound to a reader's snapshot. The matching set is computed
/// lazily, at most once.
pub struct DBQuery<'r> {
    reader: &'r dyn DBReader,
    expr: BoolExpr<DP>,
    items: OnceCell<RoaringTreemap>,
}

impl<'r> DBQuery<'r> {
    pub fn new(reader: &'r dyn DBReader, expr: BoolExpr<DP>) -> Self {
        let expr = if expr.is_dynamic() {
            expr.resolve(reader, None)
        } else {
            expr
        };
        Self {
            reader,
            expr,
            items: OnceCell::new(),
        }
    }
    pub fn expr(&self) -> &BoolExpr<DP> {
        &self.expr
    }
    fn items(&self) -> &RoaringTreemap {
        self.items
            .get_or_init(|| evaluate(self.reader.view(), &self.expr))
    }
    pub fn count(&self) -> u64 {
        self.items().len()
    }
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
    pub fn contains(&self, item: Item) -> bool {
        match self.items.get() {
            Some(items) => items.contains(item),
            None => accepts(self.reader.view(), item, &self.expr),
        }
    }
    /// The single matching item, or `NULL_ITEM` when nothing matches.
    pub fn get_item(&self) -> Item {
        single(self.items().iter(), &self.expr)
    }
    /// Like filtering by `DP::equal(attribute, key)` and taking the single
    /// item, but looked up through the value index.
    pub fn get_item_by_key(&self, attribute: &Attribute, key: &Value) -> Item {
        let candidates = equal_items(self.reader.view(), attribute, key);
        single(candidates.iter().filter(|&item| self.contains(item)), &self.expr)
    }
    pub fn copy_items_sorted(&self) -> Vec<Item> {
        self.items().iter().collect()
    }
    /// Appends to `out` the candidates that match, in the given order.
    pub fn filter_items(&self, candidates: &[Item], out: &mut Vec<Item>) {
        match self.items.get() {
            Some(items) => out.extend(candidates.iter().filter(|&&c| items.contains(c))),
            None => out.extend(filter(self.reader.view(), &self.expr, candidates)),
        }
    }
    /// Left fold over the matching items in ascending order.
    pub fn fold<A>(&self, seed: A, f: impl FnMut(A, Item) -> A) -> A {
        self.items().iter().fold(seed, f)
    }
}

fn single(mut items: impl Iterator<Item = Item>, expr: &BoolExpr<DP>) -> Item {
    let Some(first) = items.next() else {
        return NULL_ITEM;
    };
    let others = items.count();
    if others > 0 {
        warn!(%expr, first, others, "expected a single item");
    }
    first
}

// ------------- set evaluation -------------
pub(crate) fn evaluate(view: &dyn StoreView, expr: &BoolExpr<DP>) -> RoaringTreemap {
    match expr {
        BoolExpr::True => view.alive().into_owned(),
        BoolExpr::False => RoaringTreemap::new(),
        BoolExpr::Term(dp) => evaluate_dp(view, dp),
        BoolExpr::And(parts) => {
            // intersect the positive parts, then subtract the negated ones
            let (negated, positive): (Vec<_>, Vec<_>) =
                parts.iter().partition(|p| matches!(p, BoolExpr::Not(_)));
            let mut result = match positive.split_first() {
                Some((first, rest)) => {
                    let mut result = evaluate(view, first);
                    for part in rest {
                        if result.is_empty() {
                            break;
                        }
                        result &= evaluate(view, part);
                    }
                    result
                }
                None => view.alive().into_owned(),
            };
            for part in negated {
                if result.is_empty() {
                    break;
                }
                if let BoolExpr::Not(inner) = part {
                    result -= evaluate(view, inner);
                }
            }
            result
        }
        BoolExpr::Or(parts) => {
            let mut result = RoaringTreemap::new();
            for part in parts {
                result |= evaluate(view, part);
            }
            result
        }
        BoolExpr::Not(inner) => {
            let mut result = view.alive().into_owned();
            result -= evaluate(view, inner);
            result
        }
    }
}

fn compare_range(value: &Value, op: CompareOp, or_equal: bool) -> (Bound<&Value>, Bound<&Value>) {
    let edge = if or_equal {
        Bound::Included(value)
    } else {
        Bound::Excluded(value)
    };
    match op {
        CompareOp::Less => (Bound::Unbounded, edge),
        CompareOp::Greater => (edge, Bound::Unbounded),
    }
}

/// Whether a stored value satisfies an equality with `operand`. A scalar
/// operand matches a list or set that contains it; a collection operand has
/// to match the whole collection.
fn equals_operand(value: &Value, operand: &Value) -> bool {
    match operand.composition() {
        Composition::Scalar => value.contains_element(operand),
        _ => value == operand,
    }
}

/// The items satisfying `DP::Equals(attribute, operand)`. An empty operand
/// stands for null.
fn equal_items(view: &dyn StoreView, attribute: &Attribute, operand: &Value) -> RoaringTreemap {
    if operand.is_empty() {
        let mut result = view.alive().into_owned();
        result -= view.column(attribute).as_ref();
        return result;
    }
    if operand.composition() == Composition::Scalar {
        return view.items_with(attribute, operand).into_owned();
    }
    let elements = operand.elements();
    let mut candidates = view.items_with(attribute, elements[0]).into_owned();
    for element in &elements[1..] {
        candidates &= view.items_with(attribute, element).as_ref();
    }
    candidates
        .iter()
        .filter(|&item| view.value(item, attribute) == Some(operand))
        .collect()
}

fn evaluate_dp(view: &dyn StoreView, dp: &DP) -> RoaringTreemap {
    match dp {
        DP::Equals(attribute, value) => equal_items(view, attribute, value),
        DP::EqualsIdentified(attribute, identity) => match view.identity(identity.id()) {
            NULL_ITEM => RoaringTreemap::new(),
            target => equal_items(view, attribute, &Value::Item(target)),
        },
        DP::NotNull(attribute) => view.column(attribute).into_owned(),
        DP::Compare {
            attribute,
            value,
            op,
            or_equal,
        } => view.items_where(attribute, compare_range(value, *op, *or_equal), &|e: &Value| {
            DP::compare_matches(e, value, *op, *or_equal)
        }),
        DP::ReferredBy { link, inner } => {
            let mut referrers = evaluate(view, inner);
            referrers &= view.column(link).as_ref();
            let mut result = RoaringTreemap::new();
            for referrer in referrers.iter() {
                if let Some(value) = view.value(referrer, link) {
                    result.extend(value.referenced_items());
                }
            }
            result &= view.alive().as_ref();
            result
        }
        DP::Intersects(attribute, values) => {
            let mut result = RoaringTreemap::new();
            for value in values {
                result |= view.items_with(attribute, value).as_ref();
            }
            result
        }
        DP::Items(items) => items
            .iter()
            .copied()
            .filter(|&item| view.is_alive(item))
            .collect(),
        DP::Dynamic(d) => {
            warn!(predicate = ?d, "unresolved dynamic predicate matches nothing");
            RoaringTreemap::new()
        }
    }
}

// ------------- per-item evaluation -------------
pub(crate) fn accepts(view: &dyn StoreView, item: Item, expr: &BoolExpr<DP>) -> bool {
    match expr {
        BoolExpr::True => view.is_alive(item),
        BoolExpr::False => false,
        BoolExpr::Term(dp) => accepts_dp(view, item, dp),
        BoolExpr::And(parts) if parts.is_empty() => view.is_alive(item),
        BoolExpr::And(parts) => parts.iter().all(|p| accepts(view, item, p)),
        BoolExpr::Or(parts) => parts.iter().any(|p| accepts(view, item, p)),
        BoolExpr::Not(inner) => view.is_alive(item) && !accepts(view, item, inner),
    }
}

fn accepts_dp(view: &dyn StoreView, item: Item, dp: &DP) -> bool {
    match dp {
        DP::Equals(attribute, value) => {
            if value.is_empty() {
                view.is_alive(item) && view.value(item, attribute).is_none()
            } else {
                view.value(item, attribute).is_some_and(|v| equals_operand(v, value))
            }
        }
        DP::EqualsIdentified(attribute, identity) => match view.identity(identity.id()) {
            NULL_ITEM => false,
            target => view
                .value(item, attribute)
                .is_some_and(|v| equals_operand(v, &Value::Item(target))),
        },
        DP::NotNull(attribute) => view.value(item, attribute).is_some(),
        DP::Compare {
            attribute,
            value,
            op,
            or_equal,
        } => view.value(item, attribute).is_some_and(|v| {
            v.elements()
                .into_iter()
                .any(|e| DP::compare_matches(e, value, *op, *or_equal))
        }),
        DP::ReferredBy { link, inner } => {
            view.is_alive(item)
                && view
                    .items_with(link, &Value::Item(item))
                    .iter()
                    .any(|referrer| accepts(view, referrer, inner))
        }
        DP::Intersects(attribute, values) => view
            .value(item, attribute)
            .is_some_and(|v| v.elements().into_iter().any(|e| values.contains(e))),
        DP::Items(items) => items.contains(&item) && view.is_alive(item),
        DP::Dynamic(d) => {
            warn!(predicate = ?d, "unresolved dynamic predicate matches nothing");
            false
        }
    }
}

/// The candidates (sorted or not) that match, in candidate order.
pub(crate) fn filter(view: &dyn StoreView, expr: &BoolExpr<DP>, candidates: &[Item]) -> Vec<Item> {
    if candidates.len() <= PER_ITEM_LIMIT {
        candidates
            .iter()
            .copied()
            .filter(|&item| accepts(view, item, expr))
            .collect()
    } else {
        let matching = evaluate(view, expr);
        candidates
            .iter()
            .copied()
            .filter(|&item| matching.contains(item))
            .collect()
    }
}
