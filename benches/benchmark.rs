use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use itemstore::{Attribute, Database, DBEvent, Item, DP};

fn sample(seed: &mut u64, count: usize, max: u64) -> Vec<Item> {
    let mut items: Vec<Item> = (0..count)
        .map(|_| {
            *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (*seed >> 33) % max
        })
        .collect();
    items.sort_unstable();
    items.dedup();
    items
}

pub fn event_benchmark(c: &mut Criterion) {
    let mut seed = 42;
    for size in [100usize, 10_000] {
        let current = sample(&mut seed, size, size as u64 * 4);
        let affected = sample(&mut seed, size / 2, size as u64 * 4);
        let accepted: Vec<Item> = affected.iter().copied().filter(|i| i % 3 != 0).collect();
        c.bench_function(&format!("event {}", size), |b| {
            b.iter(|| {
                let mut current = current.clone();
                black_box(DBEvent::create_and_update_current(&mut current, &affected, &accepted))
            })
        });
    }
}

pub fn query_benchmark(c: &mut Criterion) {
    let db = Database::in_memory();
    db.start().expect("start");
    let (size, parent) = (Attribute::long("bench:size", "Size"), Attribute::link("bench:parent", "Parent", true));
    let (s, p) = (size.clone(), parent.clone());
    db.write_foreground(move |w| {
        let mut parents = Vec::new();
        for n in 0..100_000i64 {
            let item = w.next_item();
            w.set(item, &s, n % 1000);
            if n % 10 == 0 {
                parents.push(item);
            } else if let Some(&up) = parents.last() {
                w.set(item, &p, up);
            }
        }
        Ok(())
    })
    .wait()
    .expect("populate");

    let s = size.clone();
    c.bench_function("query equal", |b| {
        b.iter(|| {
            let s = s.clone();
            db.read_foreground(move |r| Ok(r.query(DP::equal(&s, 500i64)).count()))
                .wait()
                .expect("read")
        })
    });
    let s = size.clone();
    c.bench_function("query range and not", |b| {
        b.iter(|| {
            let s = s.clone();
            db.read_foreground(move |r| {
                let expr = DP::greater(&s, 100i64, true)
                    .and(DP::less(&s, 200i64, false))
                    .and(DP::equal(&s, 150i64).negate());
                Ok(r.query(expr).count())
            })
            .wait()
            .expect("read")
        })
    });
    let (s, p) = (size.clone(), parent.clone());
    c.bench_function("query referred by", |b| {
        b.iter(|| {
            let (s, p) = (s.clone(), p.clone());
            db.read_foreground(move |r| Ok(r.query(DP::referred_by(&p, DP::equal(&s, 7i64))).count()))
                .wait()
                .expect("read")
        })
    });
    db.stop();
}

criterion_group!(benches, event_benchmark, query_benchmark);
criterion_main!(benches);
