use itemstore::attribute::ID;
use itemstore::{Attribute, AttributeMap, BoolExpr, Database, IdentifiedObject, Item, ScalarClass, Value, DP};

fn title() -> Attribute {
    Attribute::string("test:title", "Title")
}
fn size() -> Attribute {
    Attribute::long("test:size", "Size")
}
fn tags() -> Attribute {
    Attribute::list("test:tags", "Tags", ScalarClass::Text)
}
fn labels() -> Attribute {
    Attribute::set("test:labels", "Labels", ScalarClass::Text)
}
fn address() -> Attribute {
    Attribute::map("test:address", "Address")
}
fn street() -> Attribute {
    Attribute::string("test:street", "Street")
}

fn texts(values: &[&str]) -> Vec<Value> {
    values.iter().map(|&v| Value::from(v)).collect()
}

fn started() -> Database {
    itemstore::init_logging();
    let db = Database::in_memory();
    db.start().expect("start");
    db
}

// x holds tags [a, b] and labels {p, q}, y holds tags [b], z only a title
fn tagged(db: &Database) -> (Item, Item, Item) {
    db.write_foreground(|w| {
        let x = w.next_item();
        w.set_value(x, &tags(), Value::list(texts(&["a", "b"])));
        w.set_value(x, &labels(), Value::set(texts(&["q", "p"])));
        let y = w.next_item();
        w.set_value(y, &tags(), Value::list(texts(&["b"])));
        let z = w.next_item();
        w.set(z, &title(), "untagged");
        Ok((x, y, z))
    })
    .wait()
    .expect("write")
}

#[test]
fn bulk_values_are_written_and_read_as_one_map() {
    let db = started();
    let map = AttributeMap::new()
        .with(&title(), "report")
        .with(&size(), 3i64)
        .with(&address(), AttributeMap::new().with(&street(), "Main"));
    let written = map.clone();
    let item = db
        .write_foreground(move |w| {
            let item = w.next_item();
            w.set_values(item, &written);
            Ok(item)
        })
        .wait()
        .expect("write");
    let (loaded, nested) = db
        .read_foreground(move |r| Ok((r.load_map(item), r.get::<AttributeMap>(item, &address()))))
        .wait()
        .expect("read");
    assert_eq!(loaded, map);
    let nested = nested.expect("nested map");
    assert_eq!(nested.get(&street()), Some(&Value::from("Main")));
    db.stop();
}

#[test]
fn copy_all_duplicates_values_but_not_identity() {
    let db = started();
    let origin = IdentifiedObject::new("test:origin");
    let o = origin.clone();
    let (from, to) = db
        .write_foreground(move |w| {
            let from = w.materialize(&o);
            w.set(from, &title(), "template");
            w.set_value(from, &tags(), Value::list(texts(&["a"])));
            let to = w.next_item();
            w.copy_all(from, to);
            Ok((from, to))
        })
        .wait()
        .expect("write");
    let (copied, copied_id, found) = db
        .read_foreground(move |r| Ok((r.load_map(to), r.get_value(to, &ID), r.find_materialized(&origin))))
        .wait()
        .expect("read");
    assert_eq!(copied.get(&title()), Some(&Value::from("template")));
    assert_eq!(copied.get(&tags()), Some(&Value::list(texts(&["a"]))));
    assert_eq!(copied_id, None);
    assert_eq!(found, from);
    db.stop();
}

#[test]
fn equality_on_collections() {
    let db = started();
    let (x, y, z) = tagged(&db);
    let results = db
        .read_foreground(move |r| {
            let sorted = |expr: BoolExpr<DP>| r.query(expr).copy_items_sorted();
            Ok((
                sorted(DP::equal(&tags(), "a")),
                sorted(DP::equal(&tags(), "b")),
                sorted(DP::equal(&tags(), Value::list(texts(&["a", "b"])))),
                sorted(DP::equal(&tags(), Value::list(texts(&["b", "a"])))),
                sorted(DP::equal(&labels(), Value::set(texts(&["p", "q"])))),
                r.query(DP::equal(&tags(), "a")).contains(x),
                r.query(DP::equal(&tags(), "a")).contains(y),
                r.query(DP::equal(&tags(), Value::list(Vec::new()))).contains(z),
            ))
        })
        .wait()
        .expect("read");
    let (single_a, single_b, whole, reordered, set, x_has_a, y_has_a, z_untagged) = results;
    assert_eq!(single_a, vec![x]);
    assert_eq!(single_b, vec![x, y]);
    assert_eq!(whole, vec![x]);
    assert!(reordered.is_empty());
    assert_eq!(set, vec![x]);
    assert!(x_has_a);
    assert!(!y_has_a);
    assert!(z_untagged);
    db.stop();
}

#[test]
fn key_lookup_agrees_with_equality() {
    let db = started();
    let (x, y, _) = tagged(&db);
    let found = db
        .read_foreground(|r| {
            let all = r.query(BoolExpr::true_());
            let whole = Value::list(texts(&["a", "b"]));
            Ok((
                all.get_item_by_key(&tags(), &whole),
                r.query(DP::equal(&tags(), whole.clone())).get_item(),
                all.get_item_by_key(&tags(), &Value::list(texts(&["b"]))),
                all.get_item_by_key(&tags(), &Value::from("a")),
                all.get_item_by_key(&tags(), &Value::from("missing")),
            ))
        })
        .wait()
        .expect("read");
    assert_eq!(found, (x, x, y, x, 0));
    db.stop();
}

#[test]
fn intersects_and_explicit_items() {
    let db = started();
    let (x, y, z) = tagged(&db);
    let gone = db
        .write_foreground(|w| {
            let gone = w.next_item();
            w.set(gone, &title(), "temporary");
            Ok(gone)
        })
        .wait()
        .expect("write");
    db.write_foreground(move |w| {
        w.clear_item(gone);
        Ok(())
    })
    .wait()
    .expect("clear");
    let results = db
        .read_foreground(move |r| {
            let sorted = |expr: BoolExpr<DP>| r.query(expr).copy_items_sorted();
            Ok((
                sorted(DP::intersects(&tags(), texts(&["a", "missing"]))),
                sorted(DP::intersects(&tags(), texts(&["b"]))),
                sorted(DP::items([z, x, gone])),
                sorted(DP::items([x, z]).and(DP::not_null(&tags()))),
                r.query(DP::intersects(&tags(), texts(&["b"]))).contains(y),
            ))
        })
        .wait()
        .expect("read");
    assert_eq!(results.0, vec![x]);
    assert_eq!(results.1, vec![x, y]);
    assert_eq!(results.2, vec![x, z]);
    assert_eq!(results.3, vec![x]);
    assert!(results.4);
    db.stop();
}
