use bgcore::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

/// A week of hourly readings with three meals a day
fn week() -> Data {
    let mut builder = Data::builder().clock_offset(6.0);
    for day in 0..7 {
        let start = day as f64 * 24.0;
        builder = builder.basal(start, 22.0);
        for (hour, grams, units) in [(1.0, 40.0, 4.0), (6.0, 60.0, 6.0), (12.0, 70.0, 7.0)] {
            builder = builder.meal(start + hour, grams).bolus(start + hour, units);
        }
        for hour in 0..24 {
            let value = 110.0 + 30.0 * (hour as f64 / 24.0 * std::f64::consts::TAU).sin();
            builder = builder.glucose(start + hour as f64, value);
        }
    }
    builder.build().expect("valid benchmark data")
}

/// Benchmark one evaluation of the likelihood, simulation included, as done for every proposal
fn benchmark_likelihood(c: &mut Criterion) {
    let data = week();
    let context = Context::default();
    let readings = context.observation.readings(&data);
    let parameters = ParameterVector::scalar(0.9, 10.0, 45.0).with_noise(12.0, 0.02);

    c.bench_function("log_likelihood", |b| {
        b.iter(|| {
            let _ = context.log_likelihood(
                black_box(&data),
                black_box(&readings),
                black_box(&parameters),
            );
        });
    });
}

/// Benchmark a forward simulation on a 15 minute grid
fn benchmark_simulate(c: &mut Criterion) {
    let data = week();
    let context = Context::default();
    let parameters = ParameterVector::scalar(0.9, 10.0, 45.0);
    let times: Vec<f64> = (0..(7 * 24 * 4)).map(|i| i as f64 * 0.25).collect();

    c.bench_function("simulate", |b| {
        b.iter(|| {
            let _ = context.simulate(black_box(&data), black_box(&parameters), black_box(&times));
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(std::time::Duration::from_secs(10)) // Measure for 10 seconds
        .noise_threshold(0.10); // Performance changes less than 10% will be ignored
    targets = benchmark_likelihood, benchmark_simulate
}
criterion_main!(benches);
