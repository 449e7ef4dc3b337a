use crate::common::*;
use kernelmap::core::{Instance, Resolver, Variable};
use kernelmap::map::heuristics::Heuristics;
use kernelmap::map::MemoryMap;
use kernelmap::{BuildOptions, MapConfig};

#[test]
fn test_list_round_trip() {
    for n in [1u64, 2, 3, 8] {
        let (st, types, img, tasks) = task_list(n);
        let mem = img.memory();
        let cfg = MapConfig::default();
        let heur = Heuristics::new(Resolver::new(&st, &mem), &cfg.heuristics, None);
        let mut map = MemoryMap::new(&st, &mem, cfg.clone());
        map.build(BuildOptions::default()).unwrap();

        let head = map.objects_at(BASE + 0x80);
        assert_eq!(head.len(), 1);
        let head_id = head[0].node;
        let children = &map.node(head_id).unwrap().children;
        assert_eq!(children.len(), n as usize, "list of {n}");

        for &t in &tasks {
            let found = map.objects_at(t);
            assert_eq!(found.len(), 1, "task at {t:#x} in list of {n}");
            assert_eq!(found[0].type_id, Some(types.task));
            // Elements hang off the container, not off each other.
            assert_eq!(map.node(found[0].node).unwrap().parent, Some(head_id));

            let task = Instance::new(t, types.task, "task");
            let link = heur.resolver.member_by_name(&task, "tasks").unwrap();
            assert!(heur.valid_list_head(&link, false), "link of task at {t:#x}");
        }
        assert_eq!(map.node_count(), n as usize + 1);
    }
}

#[test]
fn test_empty_list_is_not_walked() {
    let (mut st, types) = kernel_types();
    let mut img = Image::new();
    let head = BASE + 0x80;
    img.put_u64(head, head).put_u64(head + 8, head);
    st.add_variable(Variable::new("empty", types.list_head, head));
    let mem = img.memory();
    let mut map = MemoryMap::new(&st, &mem, MapConfig::default());
    map.build(BuildOptions::default()).unwrap();
    assert_eq!(map.node_count(), 1);
}

#[test]
fn test_broken_link_stops_walk() {
    let (st, _, mut img, tasks) = task_list(4);
    // The second element's link no longer points back to the first.
    img.put_u64(tasks[1] + TASKS_OFFSET + 8, BASE + 0x3000);
    let mem = img.memory();
    let mut map = MemoryMap::new(&st, &mem, MapConfig::default());
    map.build(BuildOptions::default()).unwrap();

    assert_eq!(map.objects_at(tasks[0]).len(), 1);
    assert!(map.objects_at(tasks[3]).is_empty());
}

#[test]
fn test_list_length_limit() {
    let (st, _, img, tasks) = task_list(6);
    let mem = img.memory();
    let mut cfg = MapConfig::default();
    cfg.build.max_list_length = 3;
    let mut map = MemoryMap::new(&st, &mem, cfg);
    map.build(BuildOptions::default()).unwrap();
    assert_eq!(map.objects_at(tasks[2]).len(), 1);
    assert!(map.objects_at(tasks[3]).is_empty());
}
