//! Performance benchmarks for agent-bridge
//!
//! Run with: cargo bench

use agent_bridge::{
    decode, Action, Agent, InferenceInvoker, LinearCheckpoint, LinearPolicy, Observation,
    ResponsePublisher,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

const EXAMPLE: &[u8] = br#"{"observation": {"T":300.0,"Tc":250.0,"Ca":7.5,"Cref":9.0,"Tref":280.0,"Conc_Error":1.2,"Eps_Yield":10.0,"Cb_Prod":3.3}}"#;

fn policy() -> LinearPolicy {
    LinearPolicy::new(LinearCheckpoint {
        weights: vec![vec![0.01; 8], vec![-0.02; 8]],
        bias: vec![0.5, 1.0],
        action_low: Some(-10.0),
        action_high: Some(10.0),
        reentrant: true,
    })
    .unwrap()
}

fn bench_decode(c: &mut Criterion) {
    c.bench_function("decode::valid", |b| {
        b.iter(|| decode(EXAMPLE).unwrap());
    });

    c.bench_function("decode::missing_field", |b| {
        let payload = br#"{"observation": {"T":300.0,"Tc":250.0,"Ca":7.5}}"#;
        b.iter(|| decode(payload).unwrap_err());
    });
}

fn bench_encode(c: &mut Criterion) {
    let scalar = Action::Scalar(-2.375);
    let vector = Action::Vector(vec![0.25, -1.5, 3.0]);

    c.bench_function("ResponsePublisher::encode scalar", |b| {
        b.iter(|| ResponsePublisher::encode(&scalar).unwrap());
    });

    c.bench_function("ResponsePublisher::encode vector", |b| {
        b.iter(|| ResponsePublisher::encode(&vector).unwrap());
    });
}

fn bench_inference(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let policy = policy();
    let observation = decode(EXAMPLE).unwrap();

    let vector = observation.to_vector();

    c.bench_function("LinearPolicy::execute", |b| {
        let (policy, vector) = (&policy, &vector);
        b.to_async(&rt).iter(move || policy.execute(vector));
    });

    let invoker = InferenceInvoker::serialized();
    invoker.install(Arc::new(policy)).unwrap();
    c.bench_function("InferenceInvoker::invoke", |b| {
        let (invoker, observation) = (&invoker, &observation);
        b.to_async(&rt).iter(move || invoker.invoke(observation));
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let invoker = InferenceInvoker::serialized();
    invoker.install(Arc::new(policy())).unwrap();
    let invoker = &invoker;

    c.bench_function("decode + invoke + encode", |b| {
        b.to_async(&rt).iter(|| async move {
            let observation: Observation = decode(EXAMPLE).unwrap();
            let action = invoker.invoke(&observation).await.unwrap();
            ResponsePublisher::encode(&action).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_decode,
    bench_encode,
    bench_inference,
    bench_pipeline
);
criterion_main!(benches);
