//! Itemstore – an embedded, transactional item/attribute database with live
//! queries and triggers.
//!
//! Itemstore centers on the *item*: an opaque `u64` that carries typed
//! attribute values.
//! * An [`attribute::Attribute`] is an immutable descriptor of a typed slot:
//!   id, display name, scalar class and composition (scalar, list or set).
//!   Link attributes hold item references and may *propagate* changes.
//! * A [`datatype::Value`] is what an item holds for an attribute; an
//!   [`datatype::AttributeMap`] groups several of them.
//! * An [`construct::IdentifiedObject`] is a logical identity that maps onto
//!   exactly one item once materialized.
//! * A [`predicate::BoolExpr`] over [`predicate::DP`] nodes selects items.
//!
//! ## Modules
//! * [`attribute`], [`datatype`], [`construct`] – the data model.
//! * [`predicate`] – the predicate algebra, including dynamically resolved nodes.
//! * [`store`] – the in-memory snapshot with its indexes, and the overlay a
//!   write transaction stages its changes in.
//! * [`query`] – evaluation of predicates against a snapshot.
//! * [`event`] – incremental membership diffs.
//! * [`transaction`] – the reader and writer handles given to transactions.
//! * [`trigger`] – callbacks that keep derived state inside write transactions.
//! * [`live`] – live queries and commit listeners.
//! * [`result`] – completion handles with selectable callback gates.
//! * [`scheduler`] – the two-class job queues.
//! * [`persist`] – SQLite persistence & restoration layer.
//! * [`config`] – engine settings.
//! * [`database`] – the engine itself.
//!
//! ## Transactions
//! Writes are serialized on one writer thread; each commit gets the next
//! internal change number (ICN). Reads run concurrently on a pool against a
//! consistent snapshot. Submission never blocks: it returns a
//! [`result::DBResult`] right away.
//!
//! ## Quick Start
//! ```
//! use itemstore::{Attribute, Database, DP, Value};
//! let db = Database::in_memory();
//! db.start().unwrap();
//! let title = Attribute::string("demo:title", "Title");
//! let t = title.clone();
//! let item = db
//!     .write_foreground(move |w| {
//!         let item = w.next_item();
//!         w.set_value(item, &t, Value::from("Hello"));
//!         Ok(item)
//!     })
//!     .wait()
//!     .unwrap();
//! let found = db
//!     .read_foreground(move |r| Ok(r.query(DP::equal(&title, "Hello")).get_item()))
//!     .wait()
//!     .unwrap();
//! assert_eq!(found, item);
//! db.stop();
//! ```

pub mod attribute;
pub mod config;
pub mod construct;
pub mod database;
pub mod datatype;
pub mod error;
pub mod event;
pub mod lifespan;
pub mod live;
pub mod persist;
pub mod predicate;
pub mod query;
pub mod result;
pub mod scheduler;
pub mod store;
pub mod transaction;
pub mod trigger;

pub use attribute::Attribute;
pub use crate::config::{DatabaseConfig, PersistenceMode};
pub use construct::{IdentifiedObject, Icn, Item, ItemType, NULL_ITEM};
pub use database::Database;
pub use datatype::{AttributeMap, Composition, ScalarClass, Value};
pub use error::{DBError, Result};
pub use event::DBEvent;
pub use lifespan::Lifespan;
pub use live::{DBListener, DBLiveQuery, LiveQueryListener};
pub use predicate::{BoolExpr, DynamicDp, ResolutionSubscription, DP};
pub use query::DBQuery;
pub use result::{DBResult, Gate, GateQueue};
pub use scheduler::Priority;
pub use transaction::{DBReader, DBWriter};
pub use trigger::{DBTrigger, FnTrigger};

/// Installs a `tracing` subscriber that writes to stderr, filtered by
/// `RUST_LOG` (default `info`). Does nothing when a subscriber is already
/// installed, so tests may call it repeatedly.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}
