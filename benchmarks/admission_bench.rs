use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use gradequeue::queue::{NewJob, QueueItem};
use gradequeue::store::{QueueRow, QueueStore};
use gradequeue::{RunQueue, Site, SiteConfig};

const CONFIG: &str = r#"
root: /nonexistent
repos:
  - repoid: 1
psets:
  - id: 1
    runners:
      tally: {}
"#;

fn site_with_jobs(n: i64) -> Site {
    let config = SiteConfig::from_yaml_str(CONFIG).unwrap();
    let site = Site::new(config, QueueStore::open_in_memory().unwrap());
    for cid in 0..n {
        let mut qi = QueueItem::new_job(
            &site,
            NewJob {
                reqcid: cid,
                cid: cid % 17,
                psetid: 1,
                repoid: 1,
                runner: "tally".into(),
                bhash: Some("0".repeat(40)),
                ..Default::default()
            },
        )
        .unwrap();
        qi.schedule(&site, 0, Some(cid % 17)).unwrap();
    }
    site
}

fn bench_scan(c: &mut Criterion) {
    c.bench_function("scan_500_commandless_jobs", |b| {
        b.iter_batched(
            || site_with_jobs(500),
            |site| {
                let mut rq = RunQueue::new(&site);
                black_box(rq.load().unwrap());
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_schedule(c: &mut Criterion) {
    c.bench_function("schedule_1000_rows_across_users", |b| {
        b.iter_batched(
            || {
                let store = QueueStore::open_in_memory().unwrap();
                let ids: Vec<(i64, i64)> = (0..1000)
                    .map(|i| {
                        let cid = i % 23;
                        let row = QueueRow {
                            cid,
                            reqcid: cid,
                            psetid: 1,
                            repoid: 1,
                            runnername: "tally".into(),
                            insertat: 1_000,
                            ..Default::default()
                        };
                        (store.insert(&row).unwrap(), cid)
                    })
                    .collect();
                (store, ids)
            },
            |(store, ids)| {
                for (queueid, cid) in ids {
                    black_box(store.schedule(queueid, 0, Some(cid), 2_000).unwrap());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_scan, bench_schedule);
criterion_main!(benches);
