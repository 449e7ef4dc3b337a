use crate::common::*;
use kernelmap::core::{Member, Variable};
use kernelmap::map::{BuildProgress, MemoryMap};
use kernelmap::{BuildMode, BuildOptions, BuildState, MapConfig};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

fn config(workers: usize, mode: BuildMode) -> MapConfig {
    let mut cfg = MapConfig::default();
    cfg.build.worker_count = workers;
    cfg.build.mode = mode;
    cfg
}

/// Thirty listed tasks whose parents point back into the list.
fn crosslinked() -> (kernelmap::core::SymbolTable, Image, Vec<u64>) {
    let (st, _, mut img, tasks) = task_list(30);
    for (i, &t) in tasks.iter().enumerate() {
        img.put_u64(t + 24, tasks[(i * 7 + 3) % tasks.len()]);
    }
    (st, img, tasks)
}

fn assert_no_duplicates(map: &MemoryMap<'_>) {
    let mut seen: HashMap<(u64, u64), usize> = HashMap::new();
    for id in 0..map.node_count() {
        let node = map.node(kernelmap::map::NodeId(id)).unwrap();
        *seen.entry((node.address, node.type_hash)).or_default() += 1;
    }
    for ((addr, hash), count) in seen {
        assert_eq!(count, 1, "{count} nodes of type {hash:#x} at {addr:#x}");
    }
}

fn addresses(map: &MemoryMap<'_>) -> BTreeSet<u64> {
    (0..map.node_count())
        .filter_map(|i| map.node(kernelmap::map::NodeId(i)))
        .map(|n| n.address)
        .collect()
}

#[test]
fn test_no_duplicate_nodes() {
    let (st, img, tasks) = crosslinked();
    let mem = img.memory();
    let mut map = MemoryMap::new(&st, &mem, config(1, BuildMode::Independent));
    let report = map.build(BuildOptions::default()).unwrap();
    assert_eq!(report.state, BuildState::Completed);
    assert_no_duplicates(&map);
    for t in &tasks {
        assert!(!map.objects_at(*t).is_empty(), "task at {t:#x} missing");
    }
}

#[test]
fn test_probability_bounds_both_policies() {
    let (st, img, _) = crosslinked();
    let mem = img.memory();
    for mode in [BuildMode::Independent, BuildMode::Propagating] {
        let mut map = MemoryMap::new(&st, &mem, config(1, mode));
        map.build(BuildOptions::default()).unwrap();
        assert!(map.node_count() > 0);
        for i in 0..map.node_count() {
            let p = map.node(kernelmap::map::NodeId(i)).unwrap().probability;
            assert!((0.0..=1.0).contains(&p), "{mode:?}: probability {p}");
        }
        let props = map.properties_of_range(0, u64::MAX);
        assert!(props.min_probability <= props.max_probability);
        assert!(props.max_probability <= 1.0);
    }
}

#[test]
fn test_threshold_stops_expansion() {
    let (st, _, mut img, tasks) = parent_chain(5);
    // A broken magic drops the third task below the minimum.
    img.put_u64(tasks[2], 0x1111);
    let mem = img.memory();
    let mut map = MemoryMap::new(&st, &mem, config(1, BuildMode::Independent));
    map.build(BuildOptions {
        min_probability: Some(0.1),
        ..Default::default()
    })
    .unwrap();

    let third = map.objects_at(tasks[2]);
    assert_eq!(third.len(), 1);
    assert!(third[0].probability < 0.1);
    assert!(map.objects_at(tasks[3]).is_empty());
    assert!(map.objects_at(tasks[4]).is_empty());
}

#[test]
fn test_default_threshold_expands_doubtful_root() {
    let (mut st, types) = kernel_types();
    let root = st.structure("struct root", 24, vec![
        Member::new("magic", 0, types.ulong).with_magic(0xabc),
        Member::new("good", 8, types.task_ptr),
        Member::new("none", 16, types.task_ptr),
    ]);
    let mut img = Image::new();
    let task = BASE + 0x200;
    write_task(&mut img, task, 1, 0);
    img.put_u64(BASE + 0x80, 0x1).put_u64(BASE + 0x88, task).put_u64(BASE + 0x90, 0);
    st.add_variable(Variable::new("root", root, BASE + 0x80));
    let mem = img.memory();

    let mut map = MemoryMap::new(&st, &mem, MapConfig::default());
    let report = map.build(BuildOptions::default()).unwrap();

    assert_eq!(report.nodes, 2);
    let root_p = map.objects_at(BASE + 0x80)[0].probability;
    let task_found = map.objects_at(task);
    assert_eq!(task_found.len(), 1);
    assert!(root_p < 1.0);
    assert!(task_found[0].probability > root_p);
    assert!(map.objects_at(0).is_empty());
}

#[test]
fn test_lower_threshold_reaches_further() {
    let (st, _, mut img, tasks) = parent_chain(5);
    img.put_u64(tasks[2], 0x1111);
    let mem = img.memory();
    let mut map = MemoryMap::new(&st, &mem, config(1, BuildMode::Independent));
    map.build(BuildOptions {
        min_probability: Some(0.001),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(map.objects_at(tasks[4]).len(), 1);
}

#[test]
fn test_workers_agree() {
    let (st, img, _) = crosslinked();
    let mem = img.memory();
    let mut single = MemoryMap::new(&st, &mem, config(1, BuildMode::Independent));
    single.build(BuildOptions::default()).unwrap();
    let expected = addresses(&single);

    for workers in [2, 4] {
        let mut map = MemoryMap::new(&st, &mem, config(workers, BuildMode::Independent));
        let report = map.build(BuildOptions::default()).unwrap();
        assert_eq!(report.workers, workers);
        assert_no_duplicates(&map);
        assert_eq!(addresses(&map), expected, "{workers} workers");
    }
}

#[test]
fn test_pointer_and_type_indices() {
    let (st, types, img, tasks) = parent_chain(3);
    let mem = img.memory();
    let mut map = MemoryMap::new(&st, &mem, config(1, BuildMode::Independent));
    map.build(BuildOptions::default()).unwrap();

    assert_eq!(map.type_instances(types.task).len(), 3);
    let holders = map.pointers_to(tasks[1]);
    assert_eq!(holders.len(), 1);
    assert_eq!(map.node(holders[0]).unwrap().address, tasks[0]);
    assert_eq!(map.roots().len(), 1);
    assert!(map.unknown_pointers().is_empty());
}

#[test]
fn test_cancelled_build() {
    let (st, _, img, _) = parent_chain(10);
    let mem = img.memory();
    let token = CancellationToken::new();
    token.cancel();
    let mut map = MemoryMap::new(&st, &mem, config(2, BuildMode::Independent));
    let report = map
        .build(BuildOptions {
            cancel: Some(token),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(report.state, BuildState::Cancelled);
    assert_eq!(report.processed, 0);
}

#[test]
fn test_progress_reported_at_end() {
    let (st, _, img, _) = parent_chain(10);
    let mem = img.memory();
    let calls = AtomicUsize::new(0);
    let last_processed = AtomicUsize::new(0);
    let cb = |p: &BuildProgress| {
        calls.fetch_add(1, Ordering::Relaxed);
        last_processed.store(p.processed, Ordering::Relaxed);
    };
    let mut map = MemoryMap::new(&st, &mem, config(1, BuildMode::Independent));
    let report = map
        .build(BuildOptions {
            progress: Some(&cb),
            ..Default::default()
        })
        .unwrap();
    assert!(calls.load(Ordering::Relaxed) >= 1);
    assert_eq!(last_processed.load(Ordering::Relaxed), report.processed);
}
