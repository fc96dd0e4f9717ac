use itemstore::{Attribute, Database, IdentifiedObject, ItemType, NULL_ITEM, DP};

fn started() -> Database {
    itemstore::init_logging();
    let db = Database::in_memory();
    db.start().expect("start");
    db
}

#[test]
fn materialize_is_idempotent() {
    let db = started();
    let status = IdentifiedObject::named("test:status:open", "Open");
    let s = status.clone();
    let (first, second) = db
        .write_foreground(move |w| Ok((w.materialize(&s), w.materialize(&s))))
        .wait()
        .expect("write");
    assert_eq!(first, second);
    let s = status.clone();
    let third = db.write_foreground(move |w| Ok(w.materialize(&s))).wait().expect("write");
    assert_eq!(first, third);
    let found = db
        .read_foreground(move |r| Ok(r.find_materialized(&status)))
        .wait()
        .expect("read");
    assert_eq!(found, first);
    db.stop();
}

#[test]
fn unknown_identities_are_not_materialized_by_reads() {
    let db = started();
    let found = db
        .read_foreground(|r| Ok(r.find_materialized(&IdentifiedObject::new("test:nowhere"))))
        .wait()
        .expect("read");
    assert_eq!(found, NULL_ITEM);
    db.stop();
}

#[test]
fn clearing_frees_the_identity() {
    let db = started();
    let status = IdentifiedObject::named("test:status:closed", "Closed");
    let s = status.clone();
    let first = db.write_foreground(move |w| Ok(w.materialize(&s))).wait().expect("write");
    db.write_foreground(move |w| {
        w.clear_item(first);
        Ok(())
    })
    .wait()
    .expect("clear");
    let s = status.clone();
    let second = db.write_foreground(move |w| Ok(w.materialize(&s))).wait().expect("write");
    assert_ne!(first, second);
    let alive = db.read_foreground(move |r| Ok(r.is_alive(first))).wait().expect("read");
    assert!(!alive);
    db.stop();
}

#[test]
fn identified_predicates_follow_rematerialization() {
    let db = started();
    let status_attr = Attribute::link("test:task:status", "Status", false);
    let open = IdentifiedObject::named("test:status:pending", "Pending");

    let (a, o) = (status_attr.clone(), open.clone());
    let (task, first) = db
        .write_foreground(move |w| {
            let status = w.materialize(&o);
            let task = w.next_item();
            w.set(task, &a, status);
            Ok((task, status))
        })
        .wait()
        .expect("write");

    let (a, o) = (status_attr.clone(), open.clone());
    let before = db
        .read_foreground(move |r| Ok(r.query(DP::equal_identified(&a, &o)).copy_items_sorted()))
        .wait()
        .expect("read");
    assert_eq!(before, vec![task]);

    // the task still points at the old item, so it stops matching
    db.write_foreground(move |w| {
        w.clear_item(first);
        Ok(())
    })
    .wait()
    .expect("clear");
    let (a, o) = (status_attr.clone(), open.clone());
    let after = db
        .read_foreground(move |r| Ok(r.query(DP::equal_identified(&a, &o)).count()))
        .wait()
        .expect("read");
    assert_eq!(after, 0);
    db.stop();
}

#[test]
fn typed_instances_are_found_by_type() {
    let db = started();
    let color = ItemType::new("test:color", "Color");
    let (red, blue) = (color.instance("test:color:red", "Red"), color.instance("test:color:blue", "Blue"));
    let items = db
        .write_foreground(move |w| {
            let mut items = vec![w.materialize(&red), w.materialize(&blue)];
            items.sort_unstable();
            Ok(items)
        })
        .wait()
        .expect("write");
    let found = db
        .read_foreground(move |r| Ok(r.query(DP::of_type(&color)).copy_items_sorted()))
        .wait()
        .expect("read");
    assert_eq!(found, items);
    db.stop();
}
