//! End-to-end behavior of chain construction, traversal and the worker pool,
//! run in virtual-address mode so no privileges are needed.

use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::Duration;

use pchase::traverse::SENTINEL;
use pchase::{
    traverse, AccessKind, AddressResolver, BenchConfig, BenchContext, ColorScheme, ColorSet,
    PageMap, PchaseError, StopToken, WorkerPool, WorkerSpec, Workload,
};

fn context(cfg: BenchConfig) -> BenchContext {
    BenchContext::with_resolver(cfg, AddressResolver::Virtual).unwrap()
}

fn colored(mem_size: usize, parallelism: usize) -> BenchConfig {
    BenchConfig::new()
        .mem_size(mem_size)
        .parallelism(parallelism)
        .scheme(ColorScheme::Bitmask(0x7800))
        .colors(ColorSet::from_iter([3]))
}

#[test]
fn single_chain_covers_region() {
    let ctx = context(BenchConfig::new());
    let chains = ctx.chains().unwrap();
    assert_eq!(chains.num_chains(), 1);
    assert_eq!(chains.chain_len(), 262144);
    let head = chains.heads()[0];
    assert_eq!(chains.walk(ctx.region(), 0, 262144), head);
    assert_ne!(chains.walk(ctx.region(), 0, 262143), head);
    chains.verify(ctx.region()).unwrap();
}

#[test]
fn one_color_of_sixteen() {
    let ctx = context(colored(1 << 20, 1));
    assert_eq!(ctx.chains().unwrap().chain_len(), 1024);

    let ctx = context(colored(1 << 20, 4));
    let chains = ctx.chains().unwrap();
    assert_eq!(chains.num_chains(), 4);
    assert_eq!(chains.chain_len(), 256);
    chains.verify(ctx.region()).unwrap();
    let scheme = ColorScheme::Bitmask(0x7800);
    for c in 0..chains.num_chains() {
        for e in chains.elements(ctx.region(), c) {
            assert_eq!(scheme.classify(ctx.region().vaddr(e as usize) as u64), 3);
        }
    }
}

#[test]
fn write_marks_only_visited() {
    let ctx = context(BenchConfig::new().mem_size(1 << 20));
    let region = ctx.region();
    let chains = ctx.chains().unwrap();
    let path = chains.elements(region, 0);

    let mut cursors = chains.cursors();
    assert_eq!(traverse(region, &mut cursors, 10, AccessKind::Read).unwrap(), 10);
    assert!(path.iter().all(|&e| region.sentinel(e) == 0));
    assert_eq!(cursors[0], path[10]);

    let mut cursors = chains.cursors();
    traverse(region, &mut cursors, 10, AccessKind::Write).unwrap();
    for (i, &e) in path.iter().enumerate() {
        let expect = if i < 10 { SENTINEL } else { 0 };
        assert_eq!(region.sentinel(e), expect, "element {} at step {}", e, i);
    }
}

#[test]
fn rebuild_is_idempotent() {
    let mut ctx = context(colored(1 << 20, 4).seed(9));
    let first: Vec<Vec<u32>> = {
        let chains = ctx.chains().unwrap();
        (0..4).map(|c| chains.elements(ctx.region(), c)).collect()
    };
    ctx.rebuild().unwrap();
    let chains = ctx.chains().unwrap();
    for (c, elems) in first.iter().enumerate() {
        assert_eq!(&chains.elements(ctx.region(), c), elems);
    }
}

#[test]
fn more_chains_than_colored_elements() {
    let res = BenchContext::with_resolver(colored(64 << 10, 65), AddressResolver::Virtual);
    match res {
        Err(PchaseError::InsufficientElements { found, requested }) => {
            assert_eq!((found, requested), (64, 65));
        },
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}

#[test]
fn synchronized_workers_run_for_duration() {
    let (region, chains) = context(BenchConfig::new().mem_size(4 << 20).parallelism(8))
        .into_shared()
        .unwrap();
    let mut pool = WorkerPool::new(StopToken::new());
    for (i, cursors) in chains.groups(2).into_iter().enumerate() {
        pool.add(WorkerSpec::new(format!("w{}", i),
                Workload::Chase { region: Arc::clone(&region), cursors })
            .batch(1000));
    }
    assert_eq!(pool.len(), 4);

    let running = pool.start().unwrap();
    let early = running.counts();
    assert!(running.wait(Some(Duration::from_millis(100))));
    let late = running.counts();
    let report = running.join().unwrap();
    assert!(report.elapsed >= Duration::from_millis(100));
    assert!(report.elapsed < Duration::from_millis(150));
    assert_eq!(report.counts.len(), 4);
    for w in 0..4 {
        assert!(early[w] <= late[w] && late[w] <= report.counts[w], "worker {}", w);
    }
    assert!(report.counts.iter().all(|&c| c > 0 && c % 2000 == 0));
}

#[test]
fn absent_page_is_not_resident() {
    let f = tempfile::tempfile().unwrap();
    let present = (1u64 << 63) | 0x1234;
    for (i, e) in [present, 0, present, 0].iter().enumerate() {
        f.write_all_at(&e.to_le_bytes(), (i * 8) as u64).unwrap();
    }
    let mut resolver = AddressResolver::Physical(PageMap::from_file(f, 4096));
    assert_eq!(resolver.translate(0x10).unwrap(), 0x1234 * 4096 + 0x10);
    match resolver.translate(0x1008) {
        Err(PchaseError::PageNotResident { vaddr }) => assert_eq!(vaddr, 0x1008),
        other => panic!("unexpected {:?}", other),
    }
    assert!(resolver.is_physical());
}
