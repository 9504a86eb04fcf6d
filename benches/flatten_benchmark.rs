// ========================================================================================
//
//                     TIMEFLAT FLATTENING THROUGHPUT BENCHMARK
//
// ========================================================================================
//
// Measures how many prediction times per second the engine resolves for a small grid
// of lookbehind specs over a synthetic cohort, at increasing cohort sizes.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use timeflat::{Aggregation, EventTable, FlattenOptions, PredictionTimes, SourceRegistry, TemporalSpec, flatten};

/// Prediction times per entity.
const TIMES_PER_ENTITY: usize = 10;
/// Lab events per entity.
const EVENTS_PER_ENTITY: usize = 40;
/// Days spanned by the synthetic follow-up.
const FOLLOW_UP_DAYS: i64 = 3 * 365;
const COHORT_SIZES: [usize; 3] = [2_000, 10_000, 30_000];

fn origin() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2015, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap()
}

fn synthetic_cohort(n_entities: usize) -> (PredictionTimes, SourceRegistry) {
    let mut rng = StdRng::seed_from_u64(0x5EED + n_entities as u64);
    let start = origin();

    let mut pairs = Vec::with_capacity(n_entities * TIMES_PER_ENTITY);
    let mut rows = Vec::with_capacity(n_entities * EVENTS_PER_ENTITY);
    for entity in 0..n_entities as i64 {
        for _ in 0..TIMES_PER_ENTITY {
            pairs.push((entity, start + TimeDelta::days(rng.gen_range(365..FOLLOW_UP_DAYS))));
        }
        for _ in 0..EVENTS_PER_ENTITY {
            let t = start + TimeDelta::minutes(rng.gen_range(0..FOLLOW_UP_DAYS * 24 * 60));
            rows.push((entity, t, rng.gen_range(4.0..12.0)));
        }
    }

    let mut sources = SourceRegistry::new();
    sources.insert(EventTable::from_numeric_rows("hba1c", &rows));
    (PredictionTimes::from_pairs(&pairs), sources)
}

fn spec_grid() -> Vec<TemporalSpec> {
    let mut specs = Vec::new();
    for days in [30, 365] {
        for aggregation in [Aggregation::Mean, Aggregation::Max, Aggregation::Count, Aggregation::Latest] {
            specs.push(TemporalSpec::predictor("hba1c", days, aggregation, f64::NAN));
        }
    }
    specs
}

fn benchmark_flatten(c: &mut Criterion) {
    let specs = spec_grid();
    let options = FlattenOptions {
        drop_insufficient_lookbehind: false,
        drop_insufficient_lookahead: false,
        n_workers: None,
    };

    let mut group = c.benchmark_group("flatten");
    group.sample_size(10);
    for &n_entities in &COHORT_SIZES {
        let (times, sources) = synthetic_cohort(n_entities);
        group.throughput(Throughput::Elements(times.len() as u64));
        group.bench_with_input(BenchmarkId::new("lookbehind_grid", times.len()), &times, |b, times| {
            b.iter(|| {
                let dataset = flatten(black_box(times), &sources, &specs, options.clone()).unwrap();
                black_box(dataset);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_flatten);
criterion_main!(benches);
