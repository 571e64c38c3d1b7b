//! Benchmark for selector matching and membership planning
//!
//! Target: plan a 1K-claim namespace well inside one reconcile budget

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeSpec,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;
use std::sync::Arc;

use volume_group_operator::controller::membership::plan_membership;
use volume_group_operator::domain::selector::Selector;
use volume_group_operator::{
    Context, InMemoryGroupBackend, MemoryStore, Metrics, OperatorConfig, VolumeGroup,
    VolumeGroupClass, VolumeGroupClassSpec, VolumeGroupSpec,
};

const CLAIMS: usize = 1000;

fn labels(i: usize) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), format!("app-{}", i % 10)),
        ("tier".to_string(), if i % 2 == 0 { "db" } else { "web" }.to_string()),
        ("zone".to_string(), format!("zone-{}", i % 3)),
    ])
}

fn selector() -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([("tier".to_string(), "db".to_string())])),
        match_expressions: Some(vec![
            LabelSelectorRequirement {
                key: "app".into(),
                operator: "In".into(),
                values: Some(vec!["app-0".into(), "app-2".into(), "app-4".into()]),
            },
            LabelSelectorRequirement {
                key: "zone".into(),
                operator: "NotIn".into(),
                values: Some(vec!["zone-2".into()]),
            },
        ]),
    }
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector");
    group.throughput(Throughput::Elements(1));

    let raw = selector();
    group.bench_function("parse", |b| {
        b.iter(|| {
            let _ = Selector::parse(black_box(&raw));
        });
    });

    group.finish();
}

fn bench_matches(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector");
    group.throughput(Throughput::Elements(CLAIMS as u64));

    let compiled = match Selector::parse(&selector()) {
        Ok(s) => s,
        Err(e) => panic!("benchmark selector must parse: {}", e),
    };
    let label_sets: Vec<_> = (0..CLAIMS).map(labels).collect();

    group.bench_function("match_1k_label_sets", |b| {
        b.iter(|| {
            label_sets
                .iter()
                .filter(|l| compiled.matches(black_box(l)))
                .count()
        });
    });

    group.finish();
}

fn seeded_store() -> (Arc<MemoryStore>, VolumeGroup) {
    let store = Arc::new(MemoryStore::new());
    let _ = store.create_class(&VolumeGroupClass::new(
        "gold",
        VolumeGroupClassSpec {
            driver: "bench".into(),
            parameters: BTreeMap::new(),
            deletion_policy: None,
        },
    ));
    let mut sc = StorageClass {
        provisioner: "bench".into(),
        ..Default::default()
    };
    sc.metadata.name = Some("fast".into());
    let _ = store.create_storage_class(&sc);

    for i in 0..CLAIMS {
        let mut volume = PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: "bench".into(),
                    volume_handle: format!("vol-{:04}", i),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        volume.metadata.name = Some(format!("pv-{:04}", i));
        let _ = store.create_volume(&volume);

        let mut claim = PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some("fast".into()),
                volume_name: volume.metadata.name.clone(),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        claim.metadata.name = Some(format!("claim-{:04}", i));
        claim.metadata.namespace = Some("bench".into());
        claim.metadata.labels = Some(labels(i));
        let _ = store.create_claim(&claim);
    }

    let mut group = VolumeGroup::new(
        "vg",
        VolumeGroupSpec {
            class_name: Some("gold".into()),
            ..Default::default()
        },
    );
    group.metadata.namespace = Some("bench".into());
    group.spec.source.selector = Some(selector());
    let group = store.create_group(&group).unwrap_or(group);
    (store, group)
}

fn bench_plan_membership(c: &mut Criterion) {
    let mut group = c.benchmark_group("membership");
    group.throughput(Throughput::Elements(CLAIMS as u64));

    let (store, vg) = seeded_store();
    let ctx = Context::new(
        store,
        Arc::new(InMemoryGroupBackend::new("bench")),
        OperatorConfig::new("bench"),
        Metrics::new().unwrap(),
    );
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("plan_1k_claims", |b| {
        b.iter(|| {
            rt.block_on(async {
                let _ = plan_membership(&ctx, black_box(&vg)).await;
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_matches, bench_plan_membership);
criterion_main!(benches);
