//! Broadcast target resolution benchmarks
//!
//! Compares area-scoped delivery against the full fan-out baseline at
//! 1,000-10,000 participants spread over a world whose density stays
//! constant, so an area query keeps roughly the same number of matches.
//!
//! Run with: cargo bench --bench broadcast

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use tokio::sync::mpsc;
use uuid::Uuid;

use worldlink::config::{ConnectionConfig, HubConfig};
use worldlink::consumer::{CommandConsumer, Session};
use worldlink::hub::registry::Registry;
use worldlink::hub::spatial::{SpatialIndex, DEFAULT_CELL_SIZE};
use worldlink::hub::Hub;
use worldlink::metrics::Metrics;
use worldlink::net::client::Client;
use worldlink::net::protocol::{InboundMessage, OutboundMessage, Payload};
use worldlink::participant::Identity;
use worldlink::util::vec2::Vec2;

const COUNTS: [usize; 4] = [1000, 2500, 5000, 10000];
const RADIUS: f32 = 200.0;

/// World edge giving one participant per 1000 square units
fn world_size(count: usize) -> f32 {
    (count as f32 * 1000.0).sqrt()
}

fn random_positions(count: usize) -> Vec<Vec2> {
    let mut rng = rand::thread_rng();
    let size = world_size(count);
    (0..count)
        .map(|_| Vec2::new(rng.gen_range(0.0..size), rng.gen_range(0.0..size)))
        .collect()
}

fn populated_registry(count: usize) -> (Registry, Vec<mpsc::Receiver<Payload>>) {
    let metrics = Arc::new(Metrics::new());
    let config = ConnectionConfig::default();
    let mut registry = Registry::new(DEFAULT_CELL_SIZE);
    let mut receivers = Vec::with_capacity(count);

    for (i, position) in random_positions(count).into_iter().enumerate() {
        let (client, rx) = Client::new(None, &config, metrics.clone());
        let id = client.id();
        registry.insert(client).unwrap();
        registry
            .bind_identity(id, Identity::new(Uuid::new_v4(), Uuid::new_v4(), format!("p{}", i)))
            .unwrap();
        registry.update_position(id, position).unwrap();
        receivers.push(rx);
    }
    (registry, receivers)
}

/// Radius query against a linear scan
fn bench_radius_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("radius_query");

    for count in COUNTS {
        let positions = random_positions(count);
        let mut index = SpatialIndex::new(DEFAULT_CELL_SIZE);
        for (key, position) in positions.iter().enumerate() {
            index.upsert(key, *position);
        }
        let center = Vec2::new(world_size(count) / 2.0, world_size(count) / 2.0);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("grid", count), &count, |b, _| {
            b.iter(|| black_box(index.query_radius(black_box(center), RADIUS)))
        });
        group.bench_with_input(BenchmarkId::new("linear_scan", count), &count, |b, _| {
            b.iter(|| {
                let found: Vec<usize> = positions
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.distance_sq_to(center) <= RADIUS * RADIUS)
                    .map(|(k, _)| k)
                    .collect();
                black_box(found)
            })
        });
    }

    group.finish();
}

/// Target resolution for area vs. full broadcast
fn bench_target_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("target_resolution");
    group.sample_size(50);

    for count in COUNTS {
        let (registry, _receivers) = populated_registry(count);
        let center = Vec2::new(world_size(count) / 2.0, world_size(count) / 2.0);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("area", count), &count, |b, _| {
            b.iter(|| black_box(registry.within(black_box(center), RADIUS).len()))
        });
        group.bench_with_input(BenchmarkId::new("all", count), &count, |b, _| {
            b.iter(|| black_box(registry.all().count()))
        });
    }

    group.finish();
}

struct Ignore;

#[async_trait::async_trait]
impl CommandConsumer for Ignore {
    async fn handle(&self, _session: &Session, _message: InboundMessage) {}
}

/// Full request path through the hub control loop
fn bench_hub_broadcast(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("hub_broadcast");
    group.sample_size(20);

    for count in [1000, 5000] {
        let (hub, _receivers) = rt.block_on(async {
            let (hub, _task) = Hub::spawn(HubConfig::default(), Arc::new(Metrics::new()), Arc::new(Ignore));
            let config = ConnectionConfig::default();
            let mut receivers = Vec::with_capacity(count);
            for (i, position) in random_positions(count).into_iter().enumerate() {
                let (client, rx) = Client::new(None, &config, hub.metrics().clone());
                hub.register(client.clone()).await.unwrap();
                let identity = Identity::new(Uuid::new_v4(), Uuid::new_v4(), format!("p{}", i));
                hub.identify(&client, identity.clone()).await.unwrap();
                hub.update_position(identity.participant, position).await.unwrap();
                receivers.push(rx);
            }
            (hub, receivers)
        });

        let center = Vec2::new(world_size(count) / 2.0, world_size(count) / 2.0);
        let message = OutboundMessage::info("a creature roars nearby");

        // Queues fill after a few hundred iterations; shedding a full queue
        // costs the same as a delivery for both scopes
        group.bench_with_input(BenchmarkId::new("area", count), &count, |b, _| {
            b.iter(|| {
                let report = rt.block_on(hub.broadcast_area(center, RADIUS, &message)).unwrap();
                black_box(report)
            })
        });
        group.bench_with_input(BenchmarkId::new("all", count), &count, |b, _| {
            b.iter(|| {
                let report = rt.block_on(hub.broadcast_all(&message)).unwrap();
                black_box(report)
            })
        });

        rt.block_on(hub.shutdown()).unwrap();
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_radius_query,
    bench_target_resolution,
    bench_hub_broadcast,
);
criterion_main!(benches);
