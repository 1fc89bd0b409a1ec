//! ONNX export benchmarks
//!
//! Measures lowering, serialization and verification of the synthetic
//! classifier graph.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use graft_onnx::{OnnxExporter, OnnxVerifier};
use graft_tflite::fixtures;
use graft_tflite::{GraphReconstructor, TFLiteParser};

fn classifier_graph() -> graft_core::Graph {
    let data = fixtures::single_io_classifier();
    let model = TFLiteParser::new().parse(&data).unwrap();
    GraphReconstructor::new().reconstruct(&model).unwrap()
}

fn bench_export(c: &mut Criterion) {
    let graph = classifier_graph();
    let exporter = OnnxExporter::default();
    c.bench_function("export_classifier", |b| {
        b.iter(|| exporter.export(black_box(&graph)).unwrap())
    });
}

fn bench_serialize_and_verify(c: &mut Criterion) {
    let graph = classifier_graph();
    let model = OnnxExporter::default().export(&graph).unwrap();
    let bytes = OnnxExporter::to_bytes(&model);

    let mut group = c.benchmark_group("artifact");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("serialize", |b| {
        b.iter(|| OnnxExporter::to_bytes(black_box(&model)))
    });
    group.bench_function("verify", |b| {
        let verifier = OnnxVerifier::new();
        b.iter(|| verifier.verify_bytes(black_box(&bytes)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_export, bench_serialize_and_verify);
criterion_main!(benches);
