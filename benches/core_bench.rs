//! Benchmarks for kform core operations.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kform::core::dag::Dag;
use kform::core::parser;
use kform::core::render::Renderer;
use kform::core::store::Store;
use kform::core::types::{BlockType, LocalVars, Value, Variable, Vertex, DUMMY_KEY};

fn bench_render(c: &mut Criterion) {
    let store = Store::new();
    store.add("local.a", Variable::single(Value::Int(5))).unwrap();
    store
        .add("input.name", Variable::single(Value::from("web")))
        .unwrap();
    let locals = LocalVars::new();
    let renderer = Renderer::new(&store, &locals);

    let mut group = c.benchmark_group("render");
    let cases = [
        ("literal", Value::from("plain-text")),
        ("reference", Value::from("$local.a")),
        ("arithmetic", Value::from("$local.a * 2 + 1")),
        ("concat", Value::from("'app-' + $input.name")),
    ];
    for (label, value) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(label), &value, |b, value| {
            b.iter(|| black_box(renderer.render(value.clone()).unwrap()));
        });
    }
    group.finish();
}

fn bench_store_set_instance(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_set_instance");
    for total in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(total), &total, |b, &total| {
            b.iter(|| {
                let store = Store::new();
                store.reserve("local.many", total);
                for i in 0..total {
                    store
                        .set_instance("local.many", DUMMY_KEY, i, total, Value::Int(i as i64))
                        .unwrap();
                }
                black_box(store);
            });
        });
    }
    group.finish();
}

fn bench_document_parse(c: &mut Criterion) {
    let yaml = r#"
name: bench
blocks:
  input.replicas: {type: input, default: 3}
  local.names:
    type: local
    attributes: {count: $input.replicas}
    value: "'node-' + string($count.index)"
  module.net:
    type: module
    attributes: {forEach: {a: 10.0.0.0/8, b: 192.168.0.0/16}}
    inputParams: {cidr: $each.value}
    blocks:
      input.cidr: {type: input}
      output.id: {type: output, value: $input.cidr}
  output.all: {type: output, value: "[$local.names, $module.net]"}
"#;
    c.bench_function("document_parse_build", |b| {
        b.iter(|| {
            let doc = parser::parse_document(black_box(yaml)).unwrap();
            black_box(parser::build_dag(&doc, "bench.yaml").unwrap());
        });
    });
}

fn bench_topo_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("topo_sort");
    for n in [10, 50, 100] {
        let mut dag = Dag::new();
        for i in 0..n {
            let mut v = Vertex::new(&format!("local.n{i:04}"), BlockType::Local);
            if i > 0 {
                v.dependencies.insert(format!("local.n{:04}", i - 1));
            }
            dag.add_vertex(v).unwrap();
        }
        dag.connect_dependencies().unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &dag, |b, dag| {
            b.iter(|| black_box(dag.topological_order().unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_render,
    bench_store_set_instance,
    bench_document_parse,
    bench_topo_sort
);
criterion_main!(benches);
