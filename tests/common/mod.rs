//! Common test fixtures.
//!
//! Fabricates small kernel-like memory images together with the symbol
//! tables describing them. All images are mapped linearly from
//! [`BASE`] to physical offset zero.

#![allow(dead_code)]

use kernelmap::core::{Candidate, Instance, Member, SymbolTable, TypeId, Variable};
use kernelmap::memory::{MemSpecs, MemoryImage, PageTable};
use kernelmap::rules::{RuleOracle, RuleVerdict};

/// Start of the direct mapping on x86-64.
pub const BASE: u64 = 0xffff_8800_0000_0000;

/// Size of every fabricated image.
pub const IMAGE_SIZE: usize = 0x4000;

/// Byte buffer addressed by kernel virtual addresses.
#[derive(Debug, Clone)]
pub struct Image {
    pub bytes: Vec<u8>,
}

impl Image {
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; IMAGE_SIZE],
        }
    }

    pub fn put_u64(&mut self, addr: u64, value: u64) -> &mut Self {
        let off = (addr - BASE) as usize;
        self.bytes[off..off + 8].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn memory(&self) -> MemoryImage {
        let mut table = PageTable::new();
        table.map_linear(BASE, 0, IMAGE_SIZE as u64, false);
        MemoryImage::from_bytes(self.bytes.clone(), MemSpecs::x86_64(), table)
    }
}

/// Type ids of the fixture kernel.
#[derive(Debug, Clone, Copy)]
pub struct Types {
    pub ulong: TypeId,
    pub list_head: TypeId,
    pub task: TypeId,
    pub task_ptr: TypeId,
}

/// Offset of `tasks` in `struct task_struct`.
pub const TASKS_OFFSET: u64 = 8;
pub const TASK_SIZE: u64 = 40;
pub const TASK_MAGIC: u64 = 0x57ac_6e5d;

/// Symbol table with `struct list_head` and
///
/// ```text
/// struct task_struct {
///     unsigned long magic;           // 0, checked
///     struct list_head tasks;        // 8
///     struct task_struct *parent;    // 24
///     unsigned long pid;             // 32
/// };
/// ```
///
/// The `next` pointer of every list head is known to lead to a task.
pub fn kernel_types() -> (SymbolTable, Types) {
    task_types(true)
}

/// Same types, optionally without the task candidate on `list_head.next`.
pub fn task_types(list_candidates: bool) -> (SymbolTable, Types) {
    let mut st = SymbolTable::new(8);
    let ulong = st.primitive("unsigned long", 8, false);
    let list_head = st.reserve_id();
    let lh_ptr = st.declare_pointer("struct list_head *", list_head);
    st.define_structure(list_head, "struct list_head", 16, vec![
        Member::new("next", 0, lh_ptr),
        Member::new("prev", 8, lh_ptr),
    ]);
    let task = st.reserve_id();
    let task_ptr = st.declare_pointer("struct task_struct *", task);
    st.define_structure(task, "struct task_struct", TASK_SIZE, vec![
        Member::new("magic", 0, ulong).with_magic(TASK_MAGIC),
        Member::new("tasks", TASKS_OFFSET, list_head),
        Member::new("parent", 24, task_ptr),
        Member::new("pid", 32, ulong),
    ]);
    if list_candidates {
        st.add_candidate(list_head, 0, Candidate {
            type_id: task,
            offset: TASKS_OFFSET as i64,
            condition: None,
        });
    }
    (st, Types { ulong, list_head, task, task_ptr })
}

/// Write a task at `addr` with an empty list link.
pub fn write_task(img: &mut Image, addr: u64, pid: u64, parent: u64) {
    img.put_u64(addr, TASK_MAGIC)
        .put_u64(addr + TASKS_OFFSET, 0)
        .put_u64(addr + TASKS_OFFSET + 8, 0)
        .put_u64(addr + 24, parent)
        .put_u64(addr + 32, pid);
}

/// Link the list heads at `links` into one ring, in order.
pub fn link_ring(img: &mut Image, links: &[u64]) {
    let n = links.len();
    for (i, &link) in links.iter().enumerate() {
        img.put_u64(link, links[(i + 1) % n]);
        img.put_u64(link + 8, links[(i + n - 1) % n]);
    }
}

/// A global list head `task_list` at `BASE + 0x80` anchoring `n` tasks
/// placed every 0x100 bytes from `BASE + 0x200`.
pub fn task_list(n: u64) -> (SymbolTable, Types, Image, Vec<u64>) {
    task_list_with(n, true)
}

pub fn task_list_with(n: u64, list_candidates: bool) -> (SymbolTable, Types, Image, Vec<u64>) {
    let (mut st, types) = task_types(list_candidates);
    let mut img = Image::new();
    let head = BASE + 0x80;
    let tasks: Vec<u64> = (0..n).map(|i| BASE + 0x200 + i * 0x100).collect();
    for (i, &t) in tasks.iter().enumerate() {
        write_task(&mut img, t, i as u64 + 1, 0);
    }
    let mut links = vec![head];
    links.extend(tasks.iter().map(|t| t + TASKS_OFFSET));
    link_ring(&mut img, &links);
    st.add_variable(Variable::new("task_list", types.list_head, head));
    (st, types, img, tasks)
}

/// Tasks chained through `parent`, each pointing at the next one, with a
/// global pointer `current` to the first.
pub fn parent_chain(n: u64) -> (SymbolTable, Types, Image, Vec<u64>) {
    let (mut st, types) = kernel_types();
    let mut img = Image::new();
    let tasks: Vec<u64> = (0..n).map(|i| BASE + 0x200 + i * 0x40).collect();
    for (i, &t) in tasks.iter().enumerate() {
        let parent = tasks.get(i + 1).copied().unwrap_or(0);
        write_task(&mut img, t, i as u64 + 1, parent);
    }
    img.put_u64(BASE, tasks[0]);
    st.add_variable(Variable::new("current", types.task_ptr, BASE));
    (st, types, img, tasks)
}

/// Address of the `holder` global.
pub const HOLDER: u64 = BASE + 0x80;

/// A global `struct holder { unsigned long id; void *data; }` whose `data`
/// points at the first of two tasks. `data` has a single task candidate.
pub fn holder() -> (SymbolTable, Types, Image, Vec<u64>) {
    let (mut st, types) = kernel_types();
    let void_ptr = st.pointer_to(None);
    let holder = st.structure("struct holder", 16, vec![
        Member::new("id", 0, types.ulong),
        Member::new("data", 8, void_ptr),
    ]);
    st.add_candidate(holder, 1, Candidate {
        type_id: types.task,
        offset: 0,
        condition: None,
    });
    let mut img = Image::new();
    let tasks = vec![BASE + 0x200, BASE + 0x300];
    for (i, &t) in tasks.iter().enumerate() {
        write_task(&mut img, t, i as u64 + 1, 0);
    }
    img.put_u64(HOLDER, 7).put_u64(HOLDER + 8, tasks[0]);
    st.add_variable(Variable::new("holder", holder, HOLDER));
    (st, types, img, tasks)
}

/// Rule engine with one rule, answered by a closure.
pub struct FnRules<F>(pub F);

impl<F> RuleOracle for FnRules<F>
where
    F: Fn(&Instance, &[usize]) -> RuleVerdict + Send + Sync,
{
    fn rule_count(&self) -> usize {
        1
    }

    fn resolve(&self, inst: &Instance, member_path: &[usize]) -> RuleVerdict {
        (self.0)(inst, member_path)
    }
}
