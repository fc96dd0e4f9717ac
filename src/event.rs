//! Incremental membership diffs.
//!
//! Given the tracked membership `current`, the items a transaction touched
//! (`affected`) and the touched items that match now (`accepted`), a
//! [`DBEvent`] tells what was added, removed and changed. Only `affected` is
//! ever examined, so the cost follows the size of the transaction rather
//! than the size of the database. All inputs and outputs are sorted
//! ascending.

use crate::construct::Item;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DBEvent {
    added: Vec<Item>,
    removed: Vec<Item>,
    changed: Vec<Item>,
    added_and_changed: Vec<Item>,
}

impl DBEvent {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn create(current: &[Item], affected: &[Item], accepted: &[Item]) -> Self {
        debug_assert!(is_sorted(current) && is_sorted(affected) && is_sorted(accepted));
        let removed = difference(&intersection(current, affected), accepted);
        let added = difference(accepted, current);
        let changed = intersection(accepted, current);
        Self {
            added,
            removed,
            changed,
            added_and_changed: accepted.to_vec(),
        }
    }

    /// Computes the event and moves `current` to the new membership,
    /// `(current \ affected) ∪ accepted`.
    pub fn create_and_update_current(current: &mut Vec<Item>, affected: &[Item], accepted: &[Item]) -> Self {
        let event = Self::create(current, affected, accepted);
        if !event.removed.is_empty() || !event.added.is_empty() {
            let kept = difference(current, &event.removed);
            *current = union(&kept, &event.added);
        }
        event
    }

    /// An event that reports every item in `items` as added.
    pub fn all_added(items: Vec<Item>) -> Self {
        Self {
            added_and_changed: items.clone(),
            added: items,
            ..Self::default()
        }
    }

    pub fn added(&self) -> &[Item] {
        &self.added
    }
    pub fn removed(&self) -> &[Item] {
        &self.removed
    }
    pub fn changed(&self) -> &[Item] {
        &self.changed
    }
    pub fn added_and_changed(&self) -> &[Item] {
        &self.added_and_changed
    }
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

fn is_sorted(items: &[Item]) -> bool {
    items.windows(2).all(|w| w[0] < w[1])
}

pub(crate) fn intersection(a: &[Item], b: &[Item]) -> Vec<Item> {
    let mut result = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                result.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    result
}

pub(crate) fn difference(a: &[Item], b: &[Item]) -> Vec<Item> {
    let mut result = Vec::with_capacity(a.len());
    let mut j = 0;
    for &x in a {
        while j < b.len() && b[j] < x {
            j += 1;
        }
        if j >= b.len() || b[j] != x {
            result.push(x);
        }
    }
    result
}

pub(crate) fn union(a: &[Item], b: &[Item]) -> Vec<Item> {
    let mut result = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                result.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                result.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                result.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    result.extend_from_slice(&a[i..]);
    result.extend_from_slice(&b[j..]);
    result
}
