use crate::common::*;
use kernelmap::map::MemoryMap;
use kernelmap::{BuildOptions, MapConfig};
use std::fs;

#[test]
fn test_dump_end_to_end() {
    let (st, types, img, tasks) = task_list(3);
    let mem = img.memory();
    let mut map = MemoryMap::new(&st, &mem, MapConfig::default());
    let report = map.build(BuildOptions::default()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("map.txt");
    let lines = map.dump(&path).unwrap();
    assert_eq!(lines, report.nodes);

    let text = fs::read_to_string(&path).unwrap();
    let first_task = text
        .lines()
        .find(|l| l.starts_with(&format!("0x{:016x}", tasks[0])))
        .expect("task line");
    let fields: Vec<&str> = first_task.split_whitespace().collect();
    assert_eq!(fields[1], TASK_SIZE.to_string());
    assert_eq!(fields[2], "1.0000");
    assert_eq!(fields[3], format!("0x{:08x}", types.task.0));
    assert!(first_task.ends_with("\"struct task_struct\""));
}

#[test]
fn test_dump_tree_end_to_end() {
    let (st, _, img, _) = task_list(2);
    let mem = img.memory();
    let mut map = MemoryMap::new(&st, &mem, MapConfig::default());
    map.build(BuildOptions::default()).unwrap();
    let root = map.roots()[0];

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.txt");
    map.dump_tree(&path, root, 4).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("\"task_list\" (struct list_head)"));
    assert!(lines[1].starts_with("\t |-"));
    assert!(lines[1].contains("(struct task_struct)"));
    assert!(!text.contains("[!]"));
}
