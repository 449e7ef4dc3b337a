use crate::common::*;
use kernelmap::core::Instance;
use kernelmap::map::MemoryMap;
use kernelmap::rules::{NoRules, RuleVerdict};
use kernelmap::{BuildOptions, MapConfig};

#[test]
fn test_candidates_without_rules() {
    let (st, types, img, tasks) = holder();
    let mem = img.memory();
    let mut map = MemoryMap::new(&st, &mem, MapConfig::default()).with_rules(&NoRules);
    let report = map.build(BuildOptions::default()).unwrap();

    assert!(!report.rules_used);
    let found = map.objects_at(tasks[0]);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].type_id, Some(types.task));
}

#[test]
fn test_undecided_verdicts_fall_back_to_candidates() {
    let (st, types, img, tasks) = holder();
    let mem = img.memory();
    for verdict in [RuleVerdict::NoMatch, RuleVerdict::Ambiguous, RuleVerdict::Deferred] {
        let rules = FnRules(|_: &Instance, _: &[usize]| verdict.clone());
        let mut map = MemoryMap::new(&st, &mem, MapConfig::default()).with_rules(&rules);
        let report = map.build(BuildOptions::default()).unwrap();

        assert!(report.rules_used);
        let found = map.objects_at(tasks[0]);
        assert_eq!(found.len(), 1, "{verdict:?}");
        assert_eq!(found[0].type_id, Some(types.task), "{verdict:?}");
    }
}

#[test]
fn test_rule_match_replaces_member() {
    let (st, types, img, tasks) = holder();
    let mem = img.memory();
    let (task, target) = (types.task, tasks[1]);
    let rules = FnRules(move |inst: &Instance, path: &[usize]| {
        if inst.address == HOLDER && path == [1] {
            RuleVerdict::Match(Instance::new(target, task, "data"))
        } else {
            RuleVerdict::NoMatch
        }
    });
    let mut map = MemoryMap::new(&st, &mem, MapConfig::default()).with_rules(&rules);
    map.build(BuildOptions::default()).unwrap();

    let found = map.objects_at(tasks[1]);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].type_id, Some(types.task));
    assert_eq!(map.node(found[0].node).unwrap().addr_in_parent, HOLDER + 8);
    // The pointer's own target is not where the rule led.
    assert!(map.objects_at(tasks[0]).is_empty());
}

#[test]
fn test_rules_drive_list_walk() {
    let n = 3;
    let (st, types, img, tasks) = task_list_with(n, false);
    let mem = img.memory();

    // Without candidates the list heads only lead to other list heads.
    let mut bare = MemoryMap::new(&st, &mem, MapConfig::default());
    bare.build(BuildOptions::default()).unwrap();
    assert_eq!(bare.node_count(), 1);

    let head = BASE + 0x80;
    let mut links = vec![head];
    links.extend(tasks.iter().map(|t| t + TASKS_OFFSET));
    let (list_head, task) = (types.list_head, types.task);
    let rules = FnRules(move |inst: &Instance, path: &[usize]| {
        if inst.type_id != Some(list_head) || path != [0] {
            return RuleVerdict::NoMatch;
        }
        let Some(i) = links.iter().position(|&l| l == inst.address) else {
            return RuleVerdict::NoMatch;
        };
        match links[(i + 1) % links.len()] {
            next if next == head => RuleVerdict::NoMatch,
            next => RuleVerdict::Match(Instance::new(next - TASKS_OFFSET, task, "next")),
        }
    });
    let mut map = MemoryMap::new(&st, &mem, MapConfig::default()).with_rules(&rules);
    map.build(BuildOptions::default()).unwrap();

    let head_id = map.objects_at(head)[0].node;
    assert_eq!(map.node(head_id).unwrap().children.len(), n as usize);
    for &t in &tasks {
        let found = map.objects_at(t);
        assert_eq!(found.len(), 1, "task at {t:#x}");
        assert_eq!(found[0].type_id, Some(types.task));
    }
}
