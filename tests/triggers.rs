use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use itemstore::{Attribute, Database, DBError, DBTrigger, DBWriter, FnTrigger, Item, DP};

fn price() -> Attribute {
    Attribute::long("test:price", "Price")
}
fn tax() -> Attribute {
    Attribute::long("test:tax", "Tax")
}
fn total() -> Attribute {
    Attribute::long("test:total", "Total")
}

fn started() -> Database {
    itemstore::init_logging();
    let db = Database::in_memory();
    db.start().expect("start");
    db
}

fn priced(db: &Database, amount: i64) -> Item {
    let p = price();
    db.write_foreground(move |w| {
        let item = w.next_item();
        w.set(item, &p, amount);
        Ok(item)
    })
    .wait()
    .expect("write")
}

fn long(db: &Database, item: Item, attribute: Attribute) -> Option<i64> {
    db.read_foreground(move |r| Ok(r.get::<i64>(item, &attribute)))
        .wait()
        .expect("read")
}

fn tax_trigger() -> Arc<dyn DBTrigger> {
    Arc::new(FnTrigger::new(
        "test:tax",
        DP::not_null(&price()),
        |items: &[Item], w: &mut dyn DBWriter| {
            let (p, t) = (price(), tax());
            for &item in items {
                let amount = w.get::<i64>(item, &p).unwrap_or(0);
                w.set(item, &t, amount / 10);
            }
            Ok(())
        },
    ))
}

#[test]
fn triggers_derive_values_in_the_same_transaction() {
    let db = started();
    db.register_trigger(tax_trigger()).wait().expect("register");
    let icn = db.icn();
    let item = priced(&db, 250);
    assert_eq!(db.icn(), icn + 1);
    assert_eq!(long(&db, item, tax()), Some(25));
    db.stop();
}

#[test]
fn registration_initialises_existing_items() {
    let db = started();
    let old = priced(&db, 100);
    db.register_trigger(tax_trigger()).wait().expect("register");
    assert_eq!(long(&db, old, tax()), Some(10));
    db.stop();
}

#[test]
fn later_passes_see_trigger_changes() {
    let db = started();
    // registered first, but only matches once the tax trigger has run
    let totals = Arc::new(FnTrigger::new(
        "test:total",
        DP::not_null(&tax()),
        |items: &[Item], w: &mut dyn DBWriter| {
            let (p, t, sum) = (price(), tax(), total());
            for &item in items {
                let amount = w.get::<i64>(item, &p).unwrap_or(0) + w.get::<i64>(item, &t).unwrap_or(0);
                w.set(item, &sum, amount);
            }
            Ok(())
        },
    ));
    db.register_trigger(totals).wait().expect("register");
    db.register_trigger(tax_trigger()).wait().expect("register");
    let item = priced(&db, 50);
    assert_eq!(long(&db, item, tax()), Some(5));
    assert_eq!(long(&db, item, total()), Some(55));
    db.stop();
}

#[test]
fn a_failing_trigger_fails_the_whole_write() {
    let db = started();
    let refuse = Arc::new(FnTrigger::new(
        "test:no-negative",
        DP::less(&price(), 0i64, false),
        |_items: &[Item], _w: &mut dyn DBWriter| Err(DBError::Failed("negative price".to_string())),
    ));
    db.register_trigger(refuse).wait().expect("register");
    let before = db.icn();
    let p = price();
    let result = db.write_foreground(move |w| {
        let fine = w.next_item();
        w.set(fine, &p, 5i64);
        let bad = w.next_item();
        w.set(bad, &p, -5i64);
        Ok(())
    });
    match result.wait() {
        Err(DBError::Trigger { id, message }) => {
            assert_eq!(id, "test:no-negative");
            assert!(message.contains("negative price"));
        }
        other => panic!("expected a trigger failure, got {:?}", other),
    }
    assert_eq!(db.icn(), before);
    let p = price();
    let stored = db
        .read_foreground(move |r| Ok(r.query(DP::not_null(&p)).count()))
        .wait()
        .expect("read");
    assert_eq!(stored, 0);
    db.stop();
}

#[test]
fn duplicate_ids_are_ignored() {
    let db = started();
    let calls = Arc::new(AtomicUsize::new(0));
    let make = |calls: Arc<AtomicUsize>| {
        Arc::new(FnTrigger::new(
            "test:counting",
            DP::not_null(&price()),
            move |items: &[Item], _w: &mut dyn DBWriter| {
                calls.fetch_add(items.len(), Ordering::SeqCst);
                Ok(())
            },
        ))
    };
    db.register_trigger(make(calls.clone())).wait().expect("register");
    db.register_trigger(make(calls.clone())).wait().expect("register again");
    priced(&db, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    db.stop();
}
