use std::collections::HashMap;
use std::time::{Duration, Instant};

use beltsort_core::{CategoryRoute, ClassifiedItem, DispatchScheduler, ScheduleCfg};
use beltsort_traits::Category;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn routes() -> HashMap<Category, CategoryRoute> {
    let mut m = HashMap::new();
    for (cat, dist) in [
        (Category::Metal, 0.40),
        (Category::Plastic, 0.60),
        (Category::Glass, 0.80),
        (Category::Carton, 1.00),
    ] {
        m.insert(
            cat,
            CategoryRoute {
                distance_m: dist,
                activation: Duration::from_millis(400),
                lead: Duration::ZERO,
                max_operations: None,
            },
        );
    }
    m
}

fn bench_schedule_and_poll(c: &mut Criterion) {
    let routes = routes();
    let cats = Category::ALL;

    c.bench_function("schedule_256_items_then_drain", |b| {
        b.iter(|| {
            let t0 = Instant::now();
            let mut sched = DispatchScheduler::new(ScheduleCfg {
                simultaneous_activations: false,
                min_gap: Duration::from_millis(150),
                grace: Duration::from_millis(500),
                pause_grace: Duration::from_millis(100),
            });
            for i in 0..256u64 {
                let category = cats[(i % 4) as usize];
                let trigger_at = t0 + Duration::from_millis(i * 37);
                let item = ClassifiedItem {
                    item_id: i + 1,
                    category,
                    trigger_at,
                    classify_at: trigger_at + Duration::from_millis(5),
                    confidence: 0.9,
                    bbox: None,
                };
                black_box(sched.schedule(
                    &item,
                    item.classify_at,
                    routes.get(&category),
                    0.15,
                    true,
                ));
            }
            black_box(sched.poll(t0 + Duration::from_secs(600)))
        })
    });
}

criterion_group!(benches, bench_schedule_and_poll);
criterion_main!(benches);
