use crate::common::*;
use kernelmap::map::MemoryMap;
use kernelmap::rangetree::ValidityFlags;
use kernelmap::{BuildMode, BuildOptions, MapConfig, MapError};
use std::fs;

fn aux_file(dir: &tempfile::TempDir, lines: &[String]) -> std::path::PathBuf {
    let path = dir.path().join("slabs.txt");
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

#[test]
fn test_slab_mode_adds_objects_only() {
    let (st, types, img, tasks) = parent_chain(3);
    let mem = img.memory();
    let dir = tempfile::tempdir().unwrap();
    let mut lines = vec!["# cache address".to_string()];
    lines.push(format!("task_struct {:x}", tasks[0]));
    lines.push(format!("task_struct 0x{:x}", tasks[1]));
    lines.push(format!("kmalloc-64 {:x}", BASE + 0x1000));
    lines.push(format!("kmalloc-64 {:x}", BASE + 0x1040));
    lines.push("not a valid line".to_string());
    let path = aux_file(&dir, &lines);

    let mut map = MemoryMap::new(&st, &mem, MapConfig::default());
    let report = map
        .build(BuildOptions {
            mode: Some(BuildMode::SlabCache),
            aux_data_file: Some(path),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(report.mode, BuildMode::SlabCache);
    assert_eq!(report.roots, 4);
    assert_eq!(report.nodes, 4);
    assert_eq!(report.processed, 0);
    // Pointers are not followed.
    assert!(map.objects_at(tasks[2]).is_empty());

    let typed = map.objects_at(tasks[0]);
    assert_eq!(typed[0].type_id, Some(types.task));
    assert!(typed[0].validity.contains(ValidityFlags::VALID));

    let untyped = map.objects_at(BASE + 0x1000);
    assert_eq!(untyped.len(), 1);
    assert_eq!(untyped[0].type_id, None);
    assert_eq!(untyped[0].end, BASE + 0x103f);
    assert!(untyped[0].validity.contains(ValidityFlags::MAYBE_VALID));
}

#[test]
fn test_validity_during_normal_build() {
    let (st, _, img, tasks) = parent_chain(3);
    let mem = img.memory();
    let dir = tempfile::tempdir().unwrap();
    let path = aux_file(&dir, &[format!("task_struct {:x}", tasks[0]), format!("task_struct {:x}", tasks[1])]);

    let mut map = MemoryMap::new(&st, &mem, MapConfig::default());
    map.build(BuildOptions {
        aux_data_file: Some(path),
        ..Default::default()
    })
    .unwrap();

    assert!(map.objects_at(tasks[0])[0].validity.contains(ValidityFlags::VALID));
    // Tasks are slab allocated, but no object was listed here.
    assert!(map.objects_at(tasks[2])[0].validity.contains(ValidityFlags::NOT_FOUND));
    let props = map.properties_of_range(tasks[0], tasks[2] + TASK_SIZE - 1);
    assert!(props.validity.contains(ValidityFlags::VALID | ValidityFlags::NOT_FOUND));
}

#[test]
fn test_missing_aux_file() {
    let (st, _, img, _) = parent_chain(1);
    let mem = img.memory();
    let dir = tempfile::tempdir().unwrap();
    let mut map = MemoryMap::new(&st, &mem, MapConfig::default());
    let res = map.build(BuildOptions {
        aux_data_file: Some(dir.path().join("absent.txt")),
        ..Default::default()
    });
    assert!(matches!(res, Err(MapError::Io(_))));
}
