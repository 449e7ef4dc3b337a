use crate::common::*;
use kernelmap::map::{ChangeKind, DiffOptions, MemoryMap};
use kernelmap::{BuildOptions, MapConfig};

#[test]
fn test_diff_granularity() {
    let (st, _) = kernel_types();
    let a = Image::new();
    let mut b = a.clone();
    for byte in &mut b.bytes[100..105] {
        *byte = 0xee;
    }
    let (mem_a, mem_b) = (a.memory(), b.memory());
    let mut map_a = MemoryMap::new(&st, &mem_a, MapConfig::default());
    let map_b = MemoryMap::new(&st, &mem_b, MapConfig::default());

    let report = map_a.diff_with(&map_b, &DiffOptions::default()).unwrap();
    let runs: Vec<_> = map_a.difference_index().unwrap().iter().map(|e| (e.start, e.length)).collect();
    assert_eq!(runs, vec![(96, 16)]);
    assert_eq!(report.run_count, 1);
    assert_eq!(report.total_compared, IMAGE_SIZE as u64);
    assert!(!report.cancelled);
}

#[test]
fn test_identical_snapshots() {
    let (st, _) = kernel_types();
    let img = Image::new();
    let (mem_a, mem_b) = (img.memory(), img.memory());
    let mut map_a = MemoryMap::new(&st, &mem_a, MapConfig::default());
    let map_b = MemoryMap::new(&st, &mem_b, MapConfig::default());
    let report = map_a.diff_with(&map_b, &DiffOptions::default()).unwrap();
    assert_eq!(report.run_count, 0);
    assert!(map_a.difference_index().unwrap().is_empty());
}

#[test]
fn test_changed_objects_between_snapshots() {
    let (st, types, img_a, tasks) = parent_chain(4);
    let mut img_b = img_a.clone();
    // New pid for the second task, and the fourth task overwritten by
    // something that is no task.
    img_b.put_u64(tasks[1] + 32, 4242);
    img_b.put_u64(tasks[2] + 24, 0);
    img_b.put_u64(tasks[3], 0x1111);

    let (mem_a, mem_b) = (img_a.memory(), img_b.memory());
    let mut map_a = MemoryMap::new(&st, &mem_a, MapConfig::default());
    let mut map_b = MemoryMap::new(&st, &mem_b, MapConfig::default());
    map_a.build(BuildOptions::default()).unwrap();
    map_b.build(BuildOptions::default()).unwrap();
    assert!(map_b.objects_at(tasks[3]).is_empty());

    map_a.diff_with(&map_b, &DiffOptions::default()).unwrap();
    let changes = map_a.changed_objects(&map_b).unwrap();
    let kind_at = |addr: u64| changes.iter().find(|c| c.address == addr).map(|c| c.kind);

    assert_eq!(kind_at(tasks[0]), None);
    assert_eq!(kind_at(tasks[1]), Some(ChangeKind::ValueChanged));
    assert_eq!(kind_at(tasks[2]), Some(ChangeKind::ValueChanged));
    assert_eq!(kind_at(tasks[3]), Some(ChangeKind::Replaced));

    let per_type = map_a.changed_types(&map_b).unwrap();
    let task_changes = &per_type[&Some(types.task)];
    assert_eq!(task_changes.type_name, "struct task_struct");
    assert_eq!(task_changes.value_changed, 2);
    assert_eq!(task_changes.replaced, 1);
}
