//! The tracking allocator as the process allocator, with std collections
//! going through it.

use std::collections::{BTreeMap, HashMap};

use debugheap::{
    alloc::{LeakPolicy, SystemSource, TagScope, TrackingAllocator, TrackingConfig},
    stack::{BacktraceSymbols, SymbolContext},
};

static SYMBOLS: SymbolContext<'static> = SymbolContext::new(&BacktraceSymbols);

#[global_allocator]
static HEAP: TrackingAllocator<'static, SystemSource> = TrackingAllocator::with_config(
    SystemSource,
    &SYMBOLS,
    TrackingConfig::DEFAULT.with_leak_policy(LeakPolicy::Report),
);

fn init_logging() {
    _ = env_logger::builder().is_test(true).try_init();
}

fn tagged_records(tag: &'static str) -> usize {
    let mut count = 0;
    HEAP.lock().for_each(|record| {
        if record.tag == Some(tag) {
            count += 1;
        }
    });
    count
}

#[test]
fn collections_work_and_are_tagged() {
    init_logging();
    let (numbers, names, tree) = {
        let _tag = TagScope::new("collections");
        let numbers: Vec<u64> = (0..1000).collect();
        let mut names = HashMap::new();
        for i in 0..100 {
            names.insert(format!("name {i}"), i);
        }
        let tree: BTreeMap<u32, String> = (0..50).map(|i| (i, i.to_string())).collect();
        (numbers, names, tree)
    };
    assert_eq!(numbers.iter().sum::<u64>(), 499_500);
    assert_eq!(names["name 42"], 42);
    assert_eq!(tree[&7], "7");

    // The vec, the map's table, 100 keys, the tree's nodes and 50 strings
    assert!(tagged_records("collections") >= 152);
    drop((numbers, names, tree));
    assert_eq!(tagged_records("collections"), 0);
}

#[test]
fn live_boxes_can_be_looked_up() {
    init_logging();
    let value = Box::new([7u8; 40]);
    let record = HEAP
        .allocation_info(value.as_ptr())
        .expect("a live box is on the list");
    assert_eq!(record.size, 40);
    assert_eq!(record.address, value.as_ptr() as usize);
    assert!(!record.external);
}

#[test]
fn growing_vectors_keep_their_contents() {
    init_logging();
    let mut bytes = Vec::new();
    for i in 0..10_000u32 {
        bytes.push(i as u8);
    }
    assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));
    bytes.shrink_to_fit();
    assert_eq!(bytes.len(), 10_000);
}

#[test]
fn busy_heap_has_intact_guards() {
    init_logging();
    let strings: Vec<String> = (0..500).map(|i| "x".repeat(i % 37 + 1)).collect();
    let report = HEAP.check_guards();
    assert!(report.is_clean(), "{:?}", report.violations);
    assert!(report.checked >= strings.len());
    assert!(HEAP.total_size() > 0);
}
