//! Predicate-scoped callbacks that run inside write transactions.
//!
//! After a transaction body has run, every registered trigger sees the
//! affected items that match its predicate and may write further changes in
//! the same transaction. A failing trigger fails the whole transaction.

use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::construct::Item;
use crate::error::{DBError, Result};
use crate::predicate::{BoolExpr, DP};
use crate::query;
use crate::transaction::{guarded, DBReader, DBWriter, TransactionWriter};

pub trait DBTrigger: Send + Sync {
    /// Unique id; a second registration under the same id is ignored.
    fn id(&self) -> &str;
    fn expr(&self) -> BoolExpr<DP>;
    /// Called with the sorted matching items among those the transaction
    /// changed. Never called with an empty slice.
    fn apply(&self, items: &[Item], writer: &mut dyn DBWriter) -> Result<()>;
}

/// A trigger built from a closure.
pub struct FnTrigger<F> {
    id: String,
    expr: BoolExpr<DP>,
    apply: F,
}

impl<F> FnTrigger<F>
where
    F: Fn(&[Item], &mut dyn DBWriter) -> Result<()> + Send + Sync,
{
    pub fn new(id: &str, expr: BoolExpr<DP>, apply: F) -> Self {
        Self {
            id: id.to_string(),
            expr,
            apply,
        }
    }
}

impl<F> DBTrigger for FnTrigger<F>
where
    F: Fn(&[Item], &mut dyn DBWriter) -> Result<()> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }
    fn expr(&self) -> BoolExpr<DP> {
        self.expr.clone()
    }
    fn apply(&self, items: &[Item], writer: &mut dyn DBWriter) -> Result<()> {
        (self.apply)(items, writer)
    }
}

#[derive(Default)]
pub struct TriggerRegistry {
    triggers: RwLock<Vec<Arc<dyn DBTrigger>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    /// Returns false when a trigger with the same id is already registered.
    pub fn register(&self, trigger: Arc<dyn DBTrigger>) -> bool {
        let mut triggers = self
            .triggers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if triggers.iter().any(|t| t.id() == trigger.id()) {
            warn!(trigger = trigger.id(), "trigger already registered, ignoring");
            return false;
        }
        debug!(trigger = trigger.id(), expr = %trigger.expr(), "trigger registered");
        triggers.push(trigger);
        true
    }
    pub fn triggers(&self) -> Vec<Arc<dyn DBTrigger>> {
        self.triggers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
    pub fn len(&self) -> usize {
        self.triggers().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the trigger passes of a write transaction. The first pass looks
    /// at everything the body changed, each further pass only at what the
    /// previous pass changed. Changes of the last pass are committed without
    /// being looked at again.
    pub(crate) fn run_passes(&self, writer: &mut TransactionWriter<'_>, passes: usize) -> Result<()> {
        let triggers = self.triggers();
        writer.propagate();
        if triggers.is_empty() {
            return Ok(());
        }
        writer.take_touched();
        let mut affected = writer.changed_sorted();
        for pass in 1..=passes {
            if affected.is_empty() {
                return Ok(());
            }
            for trigger in &triggers {
                run_one(trigger.as_ref(), writer, &affected, pass == 1)?;
            }
            writer.propagate();
            affected = writer.take_touched();
        }
        if !affected.is_empty() {
            debug!(
                passes,
                unchecked = affected.len(),
                "trigger passes exhausted, committing remaining changes"
            );
        }
        Ok(())
    }
}

fn run_one(
    trigger: &dyn DBTrigger,
    writer: &mut TransactionWriter<'_>,
    affected: &[Item],
    first_pass: bool,
) -> Result<()> {
    let expr = trigger.expr();
    let expr = if expr.is_dynamic() {
        expr.resolve(&*writer, None)
    } else {
        expr
    };
    // a re-materialized identity can change membership of unchanged items
    let accepted = if first_pass && writer.identities_changed(&expr) {
        writer.query(expr).copy_items_sorted()
    } else {
        query::filter(writer.view(), &expr, affected)
    };
    if accepted.is_empty() {
        return Ok(());
    }
    debug!(trigger = trigger.id(), items = accepted.len(), "applying trigger");
    apply_guarded(trigger, &accepted, writer)
}

/// Applies a trigger to every item currently matching it. Used when a
/// trigger is registered after data it covers already exists.
pub(crate) fn initialise(trigger: &dyn DBTrigger, writer: &mut TransactionWriter<'_>) -> Result<()> {
    let items = writer.query(trigger.expr()).copy_items_sorted();
    if items.is_empty() {
        return Ok(());
    }
    debug!(trigger = trigger.id(), items = items.len(), "initialising trigger");
    apply_guarded(trigger, &items, writer)
}

fn apply_guarded(trigger: &dyn DBTrigger, items: &[Item], writer: &mut TransactionWriter<'_>) -> Result<()> {
    guarded(|| trigger.apply(items, writer)).map_err(|e| match e {
        DBError::Cancelled => DBError::Cancelled,
        DBError::Trigger { .. } => e,
        other => DBError::Trigger {
            id: trigger.id().to_string(),
            message: other.to_string(),
        },
    })
}

impl fmt::Debug for dyn DBTrigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DBTrigger({}: {})", self.id(), self.expr())
    }
}
