// Times both estimation methods on simulated cohorts of increasing size.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use survtmle::data::ObservedData;
use survtmle::estimate::{EstimationOptions, Method, NuisanceSpecs, estimate};

const COHORT_SIZES: [usize; 3] = [500, 2_000, 8_000];
const HORIZON: u32 = 6;

fn expit(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn simulate_cohort(n: usize, seed: u64) -> ObservedData {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).expect("standard normal");
    let mut ftime = Vec::with_capacity(n);
    let mut ftype = Vec::with_capacity(n);
    let mut trt = Vec::with_capacity(n);
    let mut w = Vec::with_capacity(n);
    for _ in 0..n {
        let wi: f64 = normal.sample(&mut rng);
        let arm = rng.gen_bool(expit(0.4 * wi));
        let h1 = expit(-2.0 + if arm { 0.5 } else { 0.0 } + 0.4 * wi);
        let h2 = expit(-2.5);
        let mut t = 1;
        let kind = loop {
            let u: f64 = rng.gen_range(0.0..1.0);
            if u < h1 {
                break 1;
            }
            if u < h1 + h2 {
                break 2;
            }
            if t == 2 * HORIZON || rng.gen_bool(0.05) {
                break 0;
            }
            t += 1;
        };
        ftime.push(i64::from(t));
        ftype.push(kind);
        trt.push(i64::from(arm));
        w.push(wi);
    }
    ObservedData::new(
        None,
        &ftime,
        &ftype,
        &trt,
        Array2::from_shape_vec((n, 1), w).expect("covariate matrix"),
        vec!["W1".into()],
    )
    .expect("simulated cohort")
}

fn bench_methods(c: &mut Criterion) {
    let specs: NuisanceSpecs = toml::from_str(
        r#"
[treatment.parametric]
terms = ["W1"]
[censoring.parametric]
terms = ["trt", "factor(t)"]
[failure.parametric]
terms = ["trt", "W1", "factor(t)"]
"#,
    )
    .expect("nuisance specifications");

    let mut group = c.benchmark_group("estimate");
    group.sample_size(10);
    for &n in &COHORT_SIZES {
        let data = simulate_cohort(n, 7);
        for method in [Method::Hazard, Method::Mean] {
            let options = EstimationOptions::new(method, HORIZON);
            group.bench_with_input(
                BenchmarkId::new(format!("{method:?}"), n),
                &data,
                |b, data| b.iter(|| estimate(black_box(data), &specs, &options).expect("fit")),
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_methods);
criterion_main!(benches);
