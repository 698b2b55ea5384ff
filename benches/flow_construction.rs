//! Benchmarks for control flow construction.
//!
//! Measures a cold build of one large method body, the same request served
//! from the factory cache, and per-file parallel construction over a batch
//! of generated classes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ctrlflow::{
    build_flow, parse_java, Cancellation, FlowFactory, FlowOptions, JavaSource,
    LocalVariablesPolicy,
};
use rayon::prelude::*;
use std::hint::black_box;

/// A method with `blocks` repetitions of loops, branches and try/finally.
fn generate_method(blocks: usize) -> String {
    let mut body = String::from("int total = 0;\n");
    for i in 0..blocks {
        body.push_str(&format!(
            r#"
            for (int i{i} = 0; i{i} < n; i{i}++) {{
                if (i{i} % 3 == 0 && flag) {{ continue; }}
                try {{
                    total += compute(i{i});
                    if (total > limit) {{ break; }}
                }} catch (IllegalStateException e) {{
                    total = 0;
                }} finally {{
                    log(total);
                }}
            }}
            switch (total) {{
                case {i}: total++;
                default: total--;
            }}
            "#
        ));
    }
    body.push_str("return total;\n");
    format!("class Bench {{\n int run(int n, int limit, boolean flag) {{\n{body}\n}}\n}}")
}

fn parse(code: &str) -> JavaSource {
    parse_java(code).unwrap()
}

fn bench_single_method(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_flow");
    for blocks in [10, 50, 200] {
        let source = parse(&generate_method(blocks));
        group.throughput(Throughput::Bytes(source.text().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(blocks), &source, |b, source| {
            let method = source.procedure("run").unwrap();
            b.iter(|| {
                build_flow(
                    black_box(method.node),
                    source.bytes(),
                    &LocalVariablesPolicy,
                    FlowOptions::default(),
                    &Cancellation::new(),
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_cached_lookup(c: &mut Criterion) {
    let source = parse(&generate_method(50));
    let method = source.procedure("run").unwrap();
    let factory = FlowFactory::new();
    let token = Cancellation::new();
    factory
        .get_control_flow(method.node, source.bytes(), &LocalVariablesPolicy, FlowOptions::default(), 0, &token)
        .unwrap();

    c.bench_function("factory_hit", |b| {
        b.iter(|| {
            factory
                .get_control_flow(
                    black_box(method.node),
                    source.bytes(),
                    &LocalVariablesPolicy,
                    FlowOptions::default(),
                    0,
                    &token,
                )
                .unwrap()
        })
    });
}

fn bench_parallel_files(c: &mut Criterion) {
    let files: Vec<String> = (0..32).map(|i| generate_method(5 + i % 7)).collect();
    let mut group = c.benchmark_group("files");
    group.throughput(Throughput::Elements(files.len() as u64));

    group.bench_function("sequential", |b| {
        b.iter(|| {
            files
                .iter()
                .map(|code| build_all(code))
                .sum::<usize>()
        })
    });
    group.bench_function("parallel", |b| {
        b.iter(|| files.par_iter().map(|code| build_all(code)).sum::<usize>())
    });
    group.finish();
}

fn build_all(code: &str) -> usize {
    let source = parse(code);
    let factory = FlowFactory::new();
    let token = Cancellation::new();
    source
        .procedures()
        .iter()
        .map(|p| {
            factory
                .get_control_flow(p.node, source.bytes(), &LocalVariablesPolicy, FlowOptions::default(), 0, &token)
                .map(|flow| flow.size())
                .unwrap_or(0)
        })
        .sum()
}

criterion_group!(
    benches,
    bench_single_method,
    bench_cached_lookup,
    bench_parallel_files
);
criterion_main!(benches);
