use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use itemstore::{
    Attribute, BoolExpr, Database, DBEvent, DBReader, DynamicDp, Icn, Item, Lifespan, LiveQueryListener,
    ResolutionSubscription, DP,
};

const WAIT: Duration = Duration::from_secs(5);

fn color() -> Attribute {
    Attribute::string("test:color", "Color")
}

fn started() -> Database {
    itemstore::init_logging();
    let db = Database::in_memory();
    db.start().expect("start");
    db
}

fn add(db: &Database, value: &'static str) -> Item {
    let c = color();
    db.write_foreground(move |w| {
        let item = w.next_item();
        w.set(item, &c, value);
        Ok(item)
    })
    .wait()
    .expect("write")
}

/// Mirrors the membership reported through events.
#[derive(Default)]
struct Mirror {
    members: Mutex<BTreeSet<Item>>,
    events: AtomicUsize,
    last_icn: Mutex<Icn>,
}

impl LiveQueryListener for Mirror {
    fn on_database_changed(&self, event: &DBEvent, _reader: &dyn DBReader) {
        let mut members = self.members.lock().unwrap();
        for item in event.removed() {
            assert!(members.remove(item), "removed {} was not a member", item);
        }
        for item in event.added() {
            assert!(members.insert(*item), "added {} was already a member", item);
        }
        for item in event.changed() {
            assert!(members.contains(item), "changed {} is not a member", item);
        }
        self.events.fetch_add(1, Ordering::SeqCst);
    }
    fn on_icn_passed(&self, icn: Icn) {
        let mut last = self.last_icn.lock().unwrap();
        assert!(icn >= *last, "icn went backwards");
        *last = icn;
    }
}

impl Mirror {
    fn members(&self) -> Vec<Item> {
        self.members.lock().unwrap().iter().copied().collect()
    }
}

#[test]
fn initial_members_arrive_as_added() {
    let db = started();
    let red = add(&db, "red");
    add(&db, "blue");
    let mirror = Arc::new(Mirror::default());
    let live = db.live_query(Lifespan::new(), DP::equal(&color(), "red"), mirror.clone());
    assert!(live.wait_icn(db.icn(), WAIT));
    assert!(live.is_attached());
    assert_eq!(mirror.members(), vec![red]);
    assert_eq!(live.copy_items(), vec![red]);
    db.stop();
}

#[test]
fn membership_stays_complete_across_writes() {
    let db = started();
    let mirror = Arc::new(Mirror::default());
    let c = color();
    let live = db.live_query(Lifespan::new(), DP::equal(&c, "red"), mirror.clone());

    let mut items = Vec::new();
    for i in 0..20 {
        let value = if i % 3 == 0 { "red" } else { "blue" };
        items.push(add(&db, value));
    }
    // repaint some, clear others
    for (i, item) in items.iter().copied().enumerate() {
        let c = c.clone();
        db.write_background(move |w| {
            match i % 4 {
                0 => w.set(item, &c, "red"),
                1 => w.set(item, &c, "blue"),
                2 => w.clear_item(item),
                _ => w.item_changed(item),
            }
            Ok(())
        })
        .wait()
        .expect("write");
    }

    let icn = db.icn();
    assert!(live.wait_icn(icn, WAIT));
    assert!(live.is_transaction_result_visible(icn));
    let c = color();
    let expected = db
        .read_foreground(move |r| Ok(r.query(DP::equal(&c, "red")).copy_items_sorted()))
        .wait()
        .expect("read");
    assert_eq!(mirror.members(), expected);
    assert_eq!(live.copy_items(), expected);
    assert_eq!(*mirror.last_icn.lock().unwrap(), icn);
    db.stop();
}

#[test]
fn detached_queries_stop_receiving() {
    let db = started();
    let mirror = Arc::new(Mirror::default());
    let live = db.live_query(Lifespan::new(), DP::equal(&color(), "green"), mirror.clone());
    add(&db, "green");
    assert!(live.wait_icn(db.icn(), WAIT));
    assert_eq!(mirror.events.load(Ordering::SeqCst), 1);
    live.detach();
    add(&db, "green");
    add(&db, "green");
    assert_eq!(mirror.events.load(Ordering::SeqCst), 1);
    assert!(!live.is_attached());
    assert_eq!(mirror.members().len(), 1);
    db.stop();
}

/// Matches `red` or `blue` items, depending on a switch outside the database.
#[derive(Debug, Default)]
struct Switch {
    blue: AtomicBool,
    subscriptions: Mutex<Vec<ResolutionSubscription>>,
}

impl Switch {
    fn flip(&self) {
        self.blue.fetch_xor(true, Ordering::SeqCst);
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap());
        for subscription in subscriptions {
            subscription.fire();
        }
    }
}

impl DynamicDp for Switch {
    fn resolve(&self, _reader: &dyn DBReader, subscription: Option<&ResolutionSubscription>) -> BoolExpr<DP> {
        if let Some(subscription) = subscription {
            self.subscriptions.lock().unwrap().push(subscription.clone());
        }
        let value = if self.blue.load(Ordering::SeqCst) { "blue" } else { "red" };
        DP::equal(&color(), value)
    }
    fn equal_dp(&self, other: &dyn DynamicDp) -> bool {
        other
            .as_any()
            .downcast_ref::<Switch>()
            .is_some_and(|o| std::ptr::eq(self, o))
    }
    fn hash_dp(&self) -> u64 {
        self as *const Switch as u64
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn dynamic_predicates_are_resolved_again_when_stale() {
    let db = started();
    let red = add(&db, "red");
    let blue = add(&db, "blue");
    let switch = Arc::new(Switch::default());
    let mirror = Arc::new(Mirror::default());
    let live = db.live_query(Lifespan::new(), DP::dynamic(switch.clone()), mirror.clone());
    assert!(live.wait_icn(db.icn(), WAIT));
    assert_eq!(mirror.members(), vec![red]);

    switch.flip();
    // the re-resolution is queued ahead of this write
    add(&db, "green");
    assert!(live.wait_icn(db.icn(), WAIT));
    assert_eq!(mirror.members(), vec![blue]);

    // plain reads resolve on the spot
    let s = switch.clone();
    let now = db
        .read_foreground(move |r| Ok(r.query(DP::dynamic(s)).copy_items_sorted()))
        .wait()
        .expect("read");
    assert_eq!(now, vec![blue]);
    db.stop();
}

#[test]
fn live_queries_created_before_start_attach_on_start() {
    itemstore::init_logging();
    let db = Database::in_memory();
    let mirror = Arc::new(Mirror::default());
    let live = db.live_query(Lifespan::new(), DP::equal(&color(), "red"), mirror.clone());
    db.start().expect("start");
    let red = add(&db, "red");
    assert!(live.wait_icn(db.icn(), WAIT));
    assert_eq!(mirror.members(), vec![red]);
    db.stop();
}

#[test]
fn filtered_queries_narrow_their_parent() {
    let db = started();
    let shade = Attribute::string("test:shade", "Shade");
    let s = shade.clone();
    let (a, b, _c) = db
        .write_foreground(move |w| {
            let a = w.next_item();
            w.set(a, &color(), "red");
            w.set(a, &s, "dark");
            let b = w.next_item();
            w.set(b, &color(), "red");
            let c = w.next_item();
            w.set(c, &color(), "blue");
            w.set(c, &s, "dark");
            Ok((a, b, c))
        })
        .wait()
        .expect("write");
    let parent = db.live_query(Lifespan::new(), DP::equal(&color(), "red"), Arc::new(Mirror::default()));
    let mirror = Arc::new(Mirror::default());
    let narrowed = db.filtered_live_query(&parent, Lifespan::new(), DP::not_null(&shade), mirror.clone());
    assert!(narrowed.wait_icn(db.icn(), WAIT));
    assert_eq!(mirror.members(), vec![a]);

    let s = shade.clone();
    db.write_foreground(move |w| {
        w.set(b, &s, "light");
        w.set(a, &color(), "blue");
        Ok(())
    })
    .wait()
    .expect("write");
    assert!(narrowed.wait_icn(db.icn(), WAIT));
    assert_eq!(mirror.members(), vec![b]);

    // the narrowed query ends with its parent
    parent.detach();
    assert!(!narrowed.is_attached());
    db.write_foreground(move |w| {
        w.set(a, &color(), "red");
        Ok(())
    })
    .wait()
    .expect("write");
    assert_eq!(mirror.members(), vec![b]);
    db.stop();
}
