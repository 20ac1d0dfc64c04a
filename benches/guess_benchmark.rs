//! Guessing benchmarks for ALICE-Guess

use alice_guess::serializer::expand_guess;
use alice_guess::{
    AdapterSettings, AlphabetReducer, CharacterCounter, Enumerator, GuessConfig, NgramOracle,
    OracleAdapter, PasswordList, RandomWalkEstimator, StaticOracle,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::atomic::AtomicBool;

fn generate_passwords(count: usize) -> PasswordList {
    let words = ["password", "dragon", "monkey", "letmein", "shadow", "master"];
    PasswordList::from_entries(
        (0..count).map(|i| (format!("{}{}", words[i % words.len()], i % 100), 1)),
    )
}

fn short_settings() -> AdapterSettings {
    AdapterSettings {
        min_len: 4,
        max_len: 8,
        ..AdapterSettings::default()
    }
}

fn enumerate_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("enumerate");

    // Uniform-ish static model over 4 symbols
    let reducer = AlphabetReducer::identity("abcd");
    let oracle = StaticOracle::new(vec![0.3, 0.25, 0.2, 0.15, 0.1], 4);
    let adapter = OracleAdapter::new(&oracle, &reducer, short_settings()).unwrap();
    group.bench_function("static_1e-5", |b| {
        b.iter(|| {
            let mut enumerator = Enumerator::new(&adapter, black_box(1e-5), 1024, None);
            let mut total = 0usize;
            enumerator.run(|chunk| {
                total += chunk.guesses.len();
                Ok(())
            })
            .unwrap();
            total
        })
    });

    // Trained n-gram model
    let config = GuessConfig {
        min_len: 4,
        max_len: 8,
        ..GuessConfig::default()
    };
    let mut counter = CharacterCounter::new(&config.char_bag, config.min_len, config.max_len);
    let list = generate_passwords(2000).filtered(&mut counter);
    let reducer = AlphabetReducer::build(&config.char_bag, &config.reducer_settings(), &counter);
    let model = NgramOracle::fit(&list, &reducer, 3, false).unwrap();
    let adapter = OracleAdapter::new(&model, &reducer, short_settings()).unwrap();
    group.bench_function("ngram_1e-4", |b| {
        b.iter(|| {
            let mut enumerator = Enumerator::new(&adapter, black_box(1e-4), 1024, None);
            let mut total = 0usize;
            enumerator.run(|chunk| {
                total += chunk.guesses.len();
                Ok(())
            })
            .unwrap();
            total
        })
    });

    group.finish();
}

fn random_walk_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_walk");

    let reducer = AlphabetReducer::identity("abcd");
    let oracle = StaticOracle::new(vec![0.3, 0.25, 0.2, 0.15, 0.1], 4);
    let adapter = OracleAdapter::new(&oracle, &reducer, short_settings()).unwrap();
    let cancel = AtomicBool::new(false);

    for &seeds in &[1_000usize, 10_000] {
        group.throughput(Throughput::Elements(seeds as u64));
        group.bench_function(format!("sample_{}", seeds), |b| {
            b.iter(|| {
                RandomWalkEstimator::new(&adapter, &reducer, black_box(seeds), 10)
                    .with_rng_seed(7)
                    .sample(&cancel)
                    .unwrap()
            })
        });
        group.bench_function(format!("sample_{}_parallel", seeds), |b| {
            b.iter(|| {
                RandomWalkEstimator::new(&adapter, &reducer, black_box(seeds), 10)
                    .with_rng_seed(7)
                    .parallel(true)
                    .sample(&cancel)
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn expand_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("expand");

    // Case folding gives two expansions per letter
    let config = GuessConfig {
        uppercase_character_optimization: true,
        ..GuessConfig::default()
    };
    let mut counter = CharacterCounter::new(&config.char_bag, config.min_len, config.max_len);
    for pwd in ["Password", "PASSWORD", "password", "Dragon12", "dragon12"] {
        counter.observe(pwd, 10);
    }
    let reducer = AlphabetReducer::build(&config.char_bag, &config.reducer_settings(), &counter);
    let symbols = reducer.reduce_str("password").unwrap();

    group.bench_function("password_1e-6", |b| {
        b.iter(|| expand_guess(&reducer, black_box(&symbols), 0.01f64.ln(), 1e-6f64.ln()))
    });

    group.finish();
}

criterion_group!(
    benches,
    enumerate_benchmark,
    random_walk_benchmark,
    expand_benchmark,
);
criterion_main!(benches);
