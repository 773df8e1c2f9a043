use criterion::{black_box, criterion_group, criterion_main, Criterion};
use graphsync_rust::{
    block::Block,
    networking::message::{GraphSyncMessage, GraphSyncRequest},
    selector::Selector,
    storage::{BlockStore, MemoryStore},
    test_utilities::test_manager::{RandomBytes, TestBlockChain},
    traversal::walk,
};

fn bench_walk(c: &mut Criterion) {
    let store = MemoryStore::new();
    let chain = TestBlockChain::setup(&store, &mut RandomBytes::new(7), 256, 200).unwrap();
    let selector = Selector::parse(&chain.selector()).unwrap();
    c.bench_function("walk 200 block chain", |b| {
        b.iter(|| walk(chain.tip_link, selector.clone(), |link| store.get(link)))
    });
}

fn bench_selector_parse(c: &mut Criterion) {
    let chain = TestBlockChain::setup(&MemoryStore::new(), &mut RandomBytes::new(7), 16, 2).unwrap();
    let spec = chain.selector();
    c.bench_function("parse selector", |b| b.iter(|| Selector::parse(black_box(&spec))));
}

fn bench_message_codec(c: &mut Criterion) {
    let store = MemoryStore::new();
    let chain = TestBlockChain::setup(&store, &mut RandomBytes::new(7), 4096, 64).unwrap();
    let request = GraphSyncRequest::new(1, chain.tip_link, &chain.selector(), 0, vec![]).unwrap();
    let blocks: Vec<Block> = chain.blocks().unwrap();
    let message = GraphSyncMessage::new(vec![request], vec![], blocks);
    let encoded = message.encode().unwrap();

    c.bench_function("encode message", |b| b.iter(|| black_box(&message).encode()));
    c.bench_function("decode message", |b| {
        b.iter(|| GraphSyncMessage::decode(black_box(&encoded), 1 << 24))
    });
}

criterion_group!(benches, bench_walk, bench_selector_parse, bench_message_codec);
criterion_main!(benches);
