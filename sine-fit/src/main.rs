use std::time::Instant;

use env_logger::{Builder, Env};
use faer::Mat;
use gauss_sgd::{GpParams, GradientDescent, SquaredExponential};
use itertools::Itertools;
use log::info;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

type DemoResult = Result<(), Box<dyn std::error::Error>>;

/// 1-D: sin(x) + N(0, 0.1) on [1, 10], predictions on a sorted held out grid with 2 sigma bands
fn main_1d(rng: &mut ChaCha8Rng) -> DemoResult {
    let n_samples = 100;
    let new_samples = 400;
    let n_dim = 1;
    let noise = Normal::new(0., 0.1)?;

    let xs: Vec<f64> = (0..n_samples).map(|_| rng.gen_range(1.0..10.0)).collect();
    let ys: Vec<f64> = xs.iter().map(|x| x.sin() + rng.sample(&noise)).collect();
    let x = Mat::from_fn(n_samples, n_dim, |i, _| xs[i]);
    let y = Mat::from_fn(n_samples, 1, |i, _| ys[i]);

    let kernel = SquaredExponential::random(
        n_dim,
        SquaredExponential::DEFAULT_SCALE_RANGE,
        1.,
        rng,
    )?;
    let mut proc = GpParams::new(n_dim, kernel, 10, 10)
        .noise(0.1)
        .train_noise(false)
        .optimizer(GradientDescent::new(0.01))
        .verbose(1)
        .build()?;

    let now = Instant::now();
    proc.fit(&x, &y)?;
    println!("FitDuration: {:.5?}", now.elapsed());
    println!("{:?}", proc.length_scales());

    let mut grid: Vec<f64> = (0..new_samples).map(|_| rng.gen_range(1.0..10.0)).collect();
    grid.sort_by(f64::total_cmp);
    let x_new = Mat::from_fn(new_samples, 1, |i, _| grid[i]);

    let now = Instant::now();
    let (y_pred, var) = proc.predict(&x_new)?;
    println!("PredictionDuration: {:.5?}", now.elapsed());

    println!("{:>8} {:>10} {:>10} {:>10} {:>10}", "x", "sin(x)", "mean", "lower", "upper");
    for (i, xi) in grid.iter().enumerate().step_by(20) {
        let ci = 2. * var[(i, 0)].max(0.).sqrt();
        let mu = y_pred[(i, 0)];
        println!(
            "{:>8.3} {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
            xi,
            xi.sin(),
            mu,
            mu - ci,
            mu + ci
        );
    }
    let mae = grid
        .iter()
        .enumerate()
        .map(|(i, xi)| (y_pred[(i, 0)] - xi.sin()).abs())
        .sum::<f64>()
        / new_samples as f64;
    println!("Mean absolute error against sin(x): {mae:.4}");
    Ok(())
}

/// 2-D: sin(sqrt(x0) + sqrt(x1)) + N(0, 0.1) on [0, 10]^2, predictions on a 0.25 spaced grid
fn main_2d(rng: &mut ChaCha8Rng) -> DemoResult {
    let n_samples = 50;
    let n_dim = 2;
    let noise = Normal::new(0., 0.1)?;
    let truth = |a: f64, b: f64| (a.sqrt() + b.sqrt()).sin();

    let xs: Vec<(f64, f64)> = (0..n_samples)
        .map(|_| (rng.gen_range(0.0..10.0), rng.gen_range(0.0..10.0)))
        .collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|(a, b)| truth(*a, *b) + rng.sample(&noise))
        .collect();
    let x = Mat::from_fn(n_samples, n_dim, |i, j| if j == 0 { xs[i].0 } else { xs[i].1 });
    let y = Mat::from_fn(n_samples, 1, |i, _| ys[i]);

    let kernel = SquaredExponential::random(
        n_dim,
        SquaredExponential::DEFAULT_SCALE_RANGE,
        1.,
        rng,
    )?;
    let mut proc = GpParams::new(n_dim, kernel, 100, 10)
        .noise(0.1)
        .optimizer(GradientDescent::new(0.001))
        .verbose(1)
        .build()?;
    proc.fit(&x, &y)?;
    println!("{}", proc.noise());
    println!("{:?}", proc.length_scales());

    let range: Vec<f64> = (0..40_i32).map(|i| 0.25 * f64::from(i)).collect();
    let grid: Vec<(f64, f64)> = range.clone().into_iter().cartesian_product(range).collect();
    let x_new = Mat::from_fn(grid.len(), n_dim, |i, j| {
        if j == 0 {
            grid[i].0
        } else {
            grid[i].1
        }
    });
    let (y_pred, var) = proc.predict(&x_new)?;

    let (worst, widest) = grid.iter().enumerate().fold((0f64, 0f64), |(e, w), (i, p)| {
        (
            e.max((y_pred[(i, 0)] - truth(p.0, p.1)).abs()),
            w.max(2. * var[(i, 0)].max(0.).sqrt()),
        )
    });
    println!("Largest error on grid: {worst:.4}, widest 2 sigma band: {widest:.4}");
    Ok(())
}

fn main() -> DemoResult {
    let env = Env::new().filter_or("RUST_LOG", "info");
    Builder::from_env(env)
        .target(env_logger::Target::Stdout)
        .init();

    let mut rng = ChaCha8Rng::seed_from_u64(2);
    match std::env::args().nth(1).as_deref() {
        Some("2d") => {
            info!("running the 2-D demo");
            main_2d(&mut rng)
        }
        _ => {
            info!("running the 1-D demo");
            main_1d(&mut rng)
        }
    }
}
