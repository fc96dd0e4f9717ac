//! The predicate algebra: database predicates ([`DP`]) composed into boolean
//! expressions ([`BoolExpr`]).
//!
//! Expressions compare and hash structurally. Two independently built
//! expressions over equal attributes and values are the same key, which is
//! what live query and trigger bookkeeping rely on.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::attribute::{Attribute, TYPE};
use crate::construct::{IdentifiedObject, Item, ItemType};
use crate::datatype::Value;
use crate::lifespan::Lifespan;
use crate::transaction::DBReader;

// ------------- BoolExpr -------------
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BoolExpr<T> {
    True,
    False,
    Term(T),
    And(Vec<BoolExpr<T>>),
    Or(Vec<BoolExpr<T>>),
    Not(Box<BoolExpr<T>>),
}

impl<T: Clone> BoolExpr<T> {
    pub fn term(term: T) -> Self {
        BoolExpr::Term(term)
    }
    pub fn true_() -> Self {
        BoolExpr::True
    }
    pub fn false_() -> Self {
        BoolExpr::False
    }
    pub fn and(self, other: BoolExpr<T>) -> Self {
        match (self, other) {
            (BoolExpr::True, x) | (x, BoolExpr::True) => x,
            (BoolExpr::False, _) | (_, BoolExpr::False) => BoolExpr::False,
            (BoolExpr::And(mut a), BoolExpr::And(b)) => {
                a.extend(b);
                BoolExpr::And(a)
            }
            (BoolExpr::And(mut a), x) => {
                a.push(x);
                BoolExpr::And(a)
            }
            (x, BoolExpr::And(mut b)) => {
                b.insert(0, x);
                BoolExpr::And(b)
            }
            (x, y) => BoolExpr::And(vec![x, y]),
        }
    }
    pub fn or(self, other: BoolExpr<T>) -> Self {
        match (self, other) {
            (BoolExpr::False, x) | (x, BoolExpr::False) => x,
            (BoolExpr::True, _) | (_, BoolExpr::True) => BoolExpr::True,
            (BoolExpr::Or(mut a), BoolExpr::Or(b)) => {
                a.extend(b);
                BoolExpr::Or(a)
            }
            (BoolExpr::Or(mut a), x) => {
                a.push(x);
                BoolExpr::Or(a)
            }
            (x, BoolExpr::Or(mut b)) => {
                b.insert(0, x);
                BoolExpr::Or(b)
            }
            (x, y) => BoolExpr::Or(vec![x, y]),
        }
    }
    pub fn negate(self) -> Self {
        match self {
            BoolExpr::True => BoolExpr::False,
            BoolExpr::False => BoolExpr::True,
            BoolExpr::Not(inner) => *inner,
            other => BoolExpr::Not(Box::new(other)),
        }
    }
    pub fn and_all<I: IntoIterator<Item = BoolExpr<T>>>(exprs: I) -> Self {
        exprs.into_iter().fold(BoolExpr::True, |acc, e| acc.and(e))
    }
    pub fn or_all<I: IntoIterator<Item = BoolExpr<T>>>(exprs: I) -> Self {
        exprs.into_iter().fold(BoolExpr::False, |acc, e| acc.or(e))
    }
    /// Rebuilds the expression with every term replaced by an expression.
    pub fn flat_map<U: Clone>(&self, f: &mut impl FnMut(&T) -> BoolExpr<U>) -> BoolExpr<U> {
        match self {
            BoolExpr::True => BoolExpr::True,
            BoolExpr::False => BoolExpr::False,
            BoolExpr::Term(t) => f(t),
            BoolExpr::And(parts) => BoolExpr::and_all(parts.iter().map(|p| p.flat_map(&mut *f))),
            BoolExpr::Or(parts) => BoolExpr::or_all(parts.iter().map(|p| p.flat_map(&mut *f))),
            BoolExpr::Not(inner) => inner.flat_map(f).negate(),
        }
    }
    pub fn terms(&self) -> Vec<&T> {
        let mut terms = Vec::new();
        self.visit(&mut |t| terms.push(t));
        terms
    }
    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a T)) {
        match self {
            BoolExpr::True | BoolExpr::False => (),
            BoolExpr::Term(t) => f(t),
            BoolExpr::And(parts) | BoolExpr::Or(parts) => parts.iter().for_each(|p| p.visit(&mut *f)),
            BoolExpr::Not(inner) => inner.visit(f),
        }
    }
}

impl<T: fmt::Display> fmt::Display for BoolExpr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BoolExpr::True => write!(f, "TRUE"),
            BoolExpr::False => write!(f, "FALSE"),
            BoolExpr::Term(t) => write!(f, "{}", t),
            BoolExpr::And(parts) => write!(f, "({})", joined(parts, " & ")),
            BoolExpr::Or(parts) => write!(f, "({})", joined(parts, " | ")),
            BoolExpr::Not(inner) => write!(f, "!{}", inner),
        }
    }
}

fn joined<T: fmt::Display>(parts: &[BoolExpr<T>], separator: &str) -> String {
    parts.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(separator)
}

// ------------- Dynamic predicates -------------
/// A predicate node whose concrete form depends on state outside the
/// database. It is resolved into a concrete expression before evaluation.
///
/// When a subscription is supplied, the implementation must fire it once the
/// returned expression becomes stale. A resolution must not return an
/// expression containing the same node again.
pub trait DynamicDp: Send + Sync + fmt::Debug {
    fn resolve(
        &self,
        reader: &dyn DBReader,
        subscription: Option<&ResolutionSubscription>,
    ) -> BoolExpr<DP>;
    fn equal_dp(&self, other: &dyn DynamicDp) -> bool;
    fn hash_dp(&self) -> u64;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone)]
pub struct Dynamic(pub Arc<dyn DynamicDp>);

impl PartialEq for Dynamic {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.equal_dp(other.0.as_ref())
    }
}
impl Eq for Dynamic {}
impl Hash for Dynamic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash_dp());
    }
}
impl fmt::Debug for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Registration for staleness notifications of a dynamic resolution.
#[derive(Clone)]
pub struct ResolutionSubscription {
    lifespan: Lifespan,
    notify: Arc<dyn Fn() + Send + Sync>,
}

impl ResolutionSubscription {
    pub fn new(lifespan: Lifespan, notify: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            lifespan,
            notify: Arc::new(notify),
        }
    }
    pub fn lifespan(&self) -> &Lifespan {
        &self.lifespan
    }
    pub fn is_active(&self) -> bool {
        !self.lifespan.is_ended()
    }
    /// Reports that the resolution is stale. Ignored once the lifespan ended.
    pub fn fire(&self) {
        if self.is_active() {
            (self.notify)();
        }
    }
}

impl fmt::Debug for ResolutionSubscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResolutionSubscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// ------------- DP -------------
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Less,
    Greater,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DP {
    Equals(Attribute, Value),
    EqualsIdentified(Attribute, IdentifiedObject),
    NotNull(Attribute),
    Compare {
        attribute: Attribute,
        value: Value,
        op: CompareOp,
        or_equal: bool,
    },
    ReferredBy {
        link: Attribute,
        inner: Box<BoolExpr<DP>>,
    },
    Intersects(Attribute, BTreeSet<Value>),
    Items(Arc<BTreeSet<Item>>),
    Dynamic(Dynamic),
}

impl DP {
    /// Items whose value for `attribute` equals `value`.
    pub fn equal(attribute: &Attribute, value: impl Into<Value>) -> BoolExpr<DP> {
        BoolExpr::Term(DP::Equals(attribute.clone(), value.into()))
    }
    /// Items whose link `attribute` points at the item currently
    /// materialized for `identity`. For list and set links, items whose
    /// collection contains it.
    pub fn equal_identified(attribute: &Attribute, identity: &IdentifiedObject) -> BoolExpr<DP> {
        assert!(
            attribute.is_link(),
            "{} can not hold an identified object",
            attribute
        );
        BoolExpr::Term(DP::EqualsIdentified(attribute.clone(), identity.clone()))
    }
    /// Instances of an item type.
    pub fn of_type(item_type: &ItemType) -> BoolExpr<DP> {
        DP::equal_identified(&TYPE, item_type.object())
    }
    pub fn not_null(attribute: &Attribute) -> BoolExpr<DP> {
        BoolExpr::Term(DP::NotNull(attribute.clone()))
    }
    pub fn is_null(attribute: &Attribute) -> BoolExpr<DP> {
        DP::not_null(attribute).negate()
    }
    pub fn less(attribute: &Attribute, value: impl Into<Value>, or_equal: bool) -> BoolExpr<DP> {
        BoolExpr::Term(DP::Compare {
            attribute: attribute.clone(),
            value: value.into(),
            op: CompareOp::Less,
            or_equal,
        })
    }
    pub fn greater(attribute: &Attribute, value: impl Into<Value>, or_equal: bool) -> BoolExpr<DP> {
        BoolExpr::Term(DP::Compare {
            attribute: attribute.clone(),
            value: value.into(),
            op: CompareOp::Greater,
            or_equal,
        })
    }
    /// Items X such that some item Y with `Y.link == X` satisfies `inner`.
    pub fn referred_by(link: &Attribute, inner: BoolExpr<DP>) -> BoolExpr<DP> {
        assert!(link.is_link(), "{} is not a link attribute", link);
        BoolExpr::Term(DP::ReferredBy {
            link: link.clone(),
            inner: Box::new(inner),
        })
    }
    /// Items whose value, or any element of it, is one of `values`.
    pub fn intersects<I: IntoIterator<Item = Value>>(attribute: &Attribute, values: I) -> BoolExpr<DP> {
        BoolExpr::Term(DP::Intersects(attribute.clone(), values.into_iter().collect()))
    }
    pub fn items<I: IntoIterator<Item = Item>>(items: I) -> BoolExpr<DP> {
        BoolExpr::Term(DP::Items(Arc::new(items.into_iter().collect())))
    }
    pub fn dynamic(dp: Arc<dyn DynamicDp>) -> BoolExpr<DP> {
        BoolExpr::Term(DP::Dynamic(Dynamic(dp)))
    }

    pub fn compare_matches(element: &Value, value: &Value, op: CompareOp, or_equal: bool) -> bool {
        if !element.same_kind(value) {
            return false;
        }
        match (op, element.cmp(value)) {
            (_, std::cmp::Ordering::Equal) => or_equal,
            (CompareOp::Less, ord) => ord == std::cmp::Ordering::Less,
            (CompareOp::Greater, ord) => ord == std::cmp::Ordering::Greater,
        }
    }
}

impl fmt::Display for DP {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DP::Equals(a, v) => write!(f, "{} = {}", a.id(), v),
            DP::EqualsIdentified(a, o) => write!(f, "{} = {}", a.id(), o),
            DP::NotNull(a) => write!(f, "{} != null", a.id()),
            DP::Compare { attribute, value, op, or_equal } => {
                let sign = match (op, or_equal) {
                    (CompareOp::Less, false) => "<",
                    (CompareOp::Less, true) => "<=",
                    (CompareOp::Greater, false) => ">",
                    (CompareOp::Greater, true) => ">=",
                };
                write!(f, "{} {} {}", attribute.id(), sign, value)
            }
            DP::ReferredBy { link, inner } => write!(f, "referredBy({}, {})", link.id(), inner),
            DP::Intersects(a, values) => write!(f, "{} in {:?}", a.id(), values),
            DP::Items(items) => write!(f, "items({})", items.len()),
            DP::Dynamic(d) => write!(f, "{:?}", d),
        }
    }
}

// ------------- BoolExpr<DP> -------------
const MAX_RESOLUTION_DEPTH: usize = 32;

impl BoolExpr<DP> {
    /// Replaces every dynamic node by its current resolution. Nodes nested
    /// in referred-by joins are resolved as well.
    pub fn resolve(
        &self,
        reader: &dyn DBReader,
        subscription: Option<&ResolutionSubscription>,
    ) -> BoolExpr<DP> {
        self.resolve_at(reader, subscription, 0)
    }
    fn resolve_at(
        &self,
        reader: &dyn DBReader,
        subscription: Option<&ResolutionSubscription>,
        depth: usize,
    ) -> BoolExpr<DP> {
        assert!(
            depth < MAX_RESOLUTION_DEPTH,
            "dynamic predicate resolution does not terminate: {}",
            self
        );
        self.flat_map(&mut |dp| match dp {
            DP::Dynamic(d) => d.0.resolve(reader, subscription).resolve_at(reader, subscription, depth + 1),
            DP::ReferredBy { link, inner } => BoolExpr::Term(DP::ReferredBy {
                link: link.clone(),
                inner: Box::new(inner.resolve_at(reader, subscription, depth)),
            }),
            other => BoolExpr::Term(other.clone()),
        })
    }
    pub fn is_dynamic(&self) -> bool {
        self.terms().into_iter().any(|dp| match dp {
            DP::Dynamic(_) => true,
            DP::ReferredBy { inner, .. } => inner.is_dynamic(),
            _ => false,
        })
    }
    /// The attributes whose values can affect membership.
    pub fn collect_attributes(&self) -> BTreeSet<Attribute> {
        let mut attributes = BTreeSet::new();
        for dp in self.terms() {
            match dp {
                DP::Equals(a, _) | DP::EqualsIdentified(a, _) | DP::NotNull(a) | DP::Intersects(a, _) => {
                    attributes.insert(a.clone());
                }
                DP::Compare { attribute, .. } => {
                    attributes.insert(attribute.clone());
                }
                DP::ReferredBy { link, inner } => {
                    attributes.insert(link.clone());
                    attributes.extend(inner.collect_attributes());
                }
                DP::Items(_) | DP::Dynamic(_) => (),
            }
        }
        attributes
    }
    /// The logical identities the expression is parameterized by.
    pub fn identities(&self) -> Vec<IdentifiedObject> {
        let mut identities = Vec::new();
        for dp in self.terms() {
            match dp {
                DP::EqualsIdentified(_, o) => {
                    if !identities.contains(o) {
                        identities.push(o.clone());
                    }
                }
                DP::ReferredBy { inner, .. } => {
                    for o in inner.identities() {
                        if !identities.contains(&o) {
                            identities.push(o);
                        }
                    }
                }
                _ => (),
            }
        }
        identities
    }
}
