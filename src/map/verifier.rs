//! Slab allocator objects read from an auxiliary file.
//!
//! The file lists one allocated object per line as `<cache-name> <hex-address>`.
//! Lines starting with `#` are comments; lines that do not parse are logged
//! and skipped. Object sizes are derived from the spacing of the objects of
//! a cache and cache names are matched against the symbol source's types.

use crate::core::data_type::{DataTypeKind, TypeId};
use crate::core::instance::{Instance, Resolver};
use crate::core::symbols::SymbolSource;
use crate::error::{MapError, Result};
use crate::rangetree::ValidityFlags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const MAX_LEXICAL_DEPTH: usize = 32;

/// Cache names whose object type is not named after the cache.
const CACHE_TYPE_ALIASES: &[(&str, &str)] = &[
    ("blkdev_queue", "request_queue"),
    ("blkdev_ioc", "io_context"),
    ("blkdev_requests", "request"),
    ("cred_jar", "cred"),
    ("eventpoll_epi", "epitem"),
    ("eventpoll_pwq", "eppoll_entry"),
    ("ext3_inode_cache", "ext3_inode_info"),
    ("filp", "file"),
    ("fs_cache", "fs_struct"),
    ("ip6_dst_cache", "rt6_info"),
    ("ip_fib_hash", "fib_node"),
    ("mnt_cache", "vfsmount"),
    ("skbuff_head_cache", "sk_buff"),
    ("sock_inode_cache", "socket_alloc"),
    ("task_xstate", "thread_xstate"),
    ("tcp_bind_bucket", "inet_bind_bucket"),
    ("uid_cache", "user_struct"),
];

/// How a node relates to the slab objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectValidity {
    /// Not a usable instance.
    Invalid,
    /// No slab object here, and the type is never slab allocated.
    NoSlabType,
    /// No slab object here, although the type is slab allocated.
    NotFound,
    /// No slab object here, but a global variable of this type is.
    ValidGlobal,
    /// Inside a slab object of unknown type.
    MaybeValid,
    /// Overlaps a slab object without fitting into it.
    Conflict,
    /// A member of a slab object.
    Embedded,
    /// Exactly a slab object.
    Valid,
}

impl ObjectValidity {
    pub fn flag(self) -> ValidityFlags {
        match self {
            ObjectValidity::Invalid => ValidityFlags::INVALID,
            ObjectValidity::NoSlabType => ValidityFlags::NO_SLAB_TYPE,
            ObjectValidity::NotFound => ValidityFlags::NOT_FOUND,
            ObjectValidity::ValidGlobal => ValidityFlags::VALID_GLOBAL,
            ObjectValidity::MaybeValid => ValidityFlags::MAYBE_VALID,
            ObjectValidity::Conflict => ValidityFlags::CONFLICT,
            ObjectValidity::Embedded => ValidityFlags::EMBEDDED,
            ObjectValidity::Valid => ValidityFlags::VALID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabCache {
    pub name: String,
    /// Bytes per object, once known.
    pub object_size: Option<u64>,
    pub type_id: Option<TypeId>,
    pub objects: Vec<u64>,
}

impl SlabCache {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            object_size: None,
            type_id: None,
            objects: Vec::new(),
        }
    }
}

/// A slab object and the cache it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabObject<'a> {
    pub address: u64,
    pub cache: &'a SlabCache,
}

#[derive(Debug, Clone, Default)]
pub struct SlabObjects {
    caches: Vec<SlabCache>,
    indices: HashMap<String, usize>,
    objects: BTreeMap<u64, usize>,
    /// Hashes of the types some cache holds.
    slab_hashes: HashSet<u64>,
    /// Type hashes of the global variables, by address.
    globals: BTreeMap<u64, Vec<u64>>,
}

impl SlabObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an auxiliary slab file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let objects = Self::parse(&text, &path.display().to_string());
        info!(
            file = %path.display(),
            caches = objects.caches.len(),
            objects = objects.len(),
            "Read slab objects"
        );
        Ok(objects)
    }

    /// Parse slab lines. Malformed lines are skipped with a warning.
    pub fn parse(text: &str, source_name: &str) -> Self {
        let mut objects = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line, source_name, idx + 1) {
                Ok((name, address)) => objects.add_object(name, address),
                Err(e) => warn!(error = %e, "Ignoring slab line"),
            }
        }
        objects
    }

    /// Record an object. An address listed again moves to the later cache.
    pub fn add_object(&mut self, cache: &str, address: u64) {
        let index = match self.indices.get(cache) {
            Some(&i) => i,
            None => {
                self.caches.push(SlabCache::new(cache));
                self.indices.insert(cache.to_string(), self.caches.len() - 1);
                self.caches.len() - 1
            }
        };
        match self.objects.insert(address, index) {
            Some(old) if old == index => return,
            Some(old) => {
                let previous = &mut self.caches[old];
                warn!(
                    address = format_args!("{address:#x}"),
                    previous = %previous.name,
                    cache,
                    "Slab object listed twice"
                );
                previous.objects.retain(|&a| a != address);
            }
            None => {}
        }
        self.caches[index].objects.push(address);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn caches(&self) -> &[SlabCache] {
        &self.caches
    }

    pub fn cache(&self, name: &str) -> Option<&SlabCache> {
        self.indices.get(name).map(|&i| &self.caches[i])
    }

    /// Objects whose cache type is known.
    pub fn typed_object_count(&self) -> usize {
        self.caches
            .iter()
            .filter(|c| c.type_id.is_some())
            .map(|c| c.objects.len())
            .sum()
    }

    /// Every object with its cache, by address.
    pub fn objects(&self) -> impl Iterator<Item = SlabObject<'_>> + '_ {
        self.objects.iter().map(|(&address, &i)| SlabObject {
            address,
            cache: &self.caches[i],
        })
    }

    /// Derive object sizes and cache types, and index the globals.
    pub fn resolve(&mut self, symbols: &dyn SymbolSource) {
        self.slab_hashes.clear();
        self.globals.clear();
        for cache in &mut self.caches {
            cache.objects.sort_unstable();
            cache.objects.dedup();
            cache.object_size = cache
                .objects
                .windows(2)
                .map(|w| w[1] - w[0])
                .filter(|&d| d > 0)
                .min();
            resolve_cache_type(cache, symbols);
            match cache.type_id.and_then(|id| symbols.type_by_id(id)) {
                Some(t) => debug!(cache = %cache.name, size = ?cache.object_size, type_name = %t.pretty_name(), "Slab cache resolved"),
                None => debug!(cache = %cache.name, size = ?cache.object_size, "Slab cache without type"),
            }
            if let Some(hash) = cache.type_id.and_then(|id| base_hash(symbols, id)) {
                self.slab_hashes.insert(hash);
            }
        }
        for var in symbols.variables() {
            if let Some(hash) = base_hash(symbols, var.type_id) {
                self.globals.entry(var.address).or_default().push(hash);
            }
        }
    }

    /// The object containing `address`. An object of unknown size only
    /// contains its first byte.
    pub fn object_at(&self, address: u64) -> Option<SlabObject<'_>> {
        let (&start, &i) = self.objects.range(..=address).next_back()?;
        let cache = &self.caches[i];
        let inside = match cache.object_size {
            Some(size) => address - start < size,
            None => address == start,
        };
        inside.then_some(SlabObject {
            address: start,
            cache,
        })
    }

    /// Classify `inst` against the slab objects.
    pub fn object_validity(&self, resolver: &Resolver<'_>, inst: &Instance) -> ObjectValidity {
        let Some(dt) = resolver.base_type(inst) else {
            return ObjectValidity::Invalid;
        };
        if inst.is_null() {
            return ObjectValidity::Invalid;
        }

        let Some(obj) = self.object_at(inst.address) else {
            if !self.slab_hashes.contains(&dt.hash) {
                return ObjectValidity::NoSlabType;
            }
            let global = self
                .globals
                .get(&inst.address)
                .is_some_and(|hashes| hashes.contains(&dt.hash));
            return if global {
                ObjectValidity::ValidGlobal
            } else {
                ObjectValidity::NotFound
            };
        };

        let Some(obj_type) = obj.cache.type_id.and_then(|id| resolver.strip_lexical(id)) else {
            return ObjectValidity::MaybeValid;
        };
        if inst.address == obj.address && obj_type.hash == dt.hash {
            return ObjectValidity::Valid;
        }
        if resolver.embeds(obj_type, obj.address, inst.address, dt.hash) {
            return ObjectValidity::Embedded;
        }
        ObjectValidity::Conflict
    }
}

/// Structural hash of `id` with typedefs and qualifiers removed.
fn base_hash(symbols: &dyn SymbolSource, id: TypeId) -> Option<u64> {
    let mut dt = symbols.type_by_id(id)?;
    for _ in 0..MAX_LEXICAL_DEPTH {
        if !dt.kind.is_lexical() {
            return Some(dt.hash);
        }
        dt = symbols.type_by_id(dt.target()?)?;
    }
    None
}

fn parse_line<'l>(line: &'l str, source_name: &str, line_no: usize) -> Result<(&'l str, u64)> {
    let bad = |message: String| MapError::ParseError {
        source_name: source_name.to_string(),
        line: line_no,
        message,
    };
    let words: Vec<&str> = line.split_whitespace().collect();
    let [name, addr] = words[..] else {
        return Err(bad(format!("expected two words, found {}", words.len())));
    };
    let digits = addr
        .strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
        .unwrap_or(addr);
    let address = u64::from_str_radix(digits, 16).map_err(|e| bad(format!("bad address {addr:?}: {e}")))?;
    Ok((name, address))
}

/// Type names a cache's objects may have, most specific first.
fn cache_type_names(cache: &str) -> Vec<String> {
    let base = match CACHE_TYPE_ALIASES.iter().find(|(c, _)| *c == cache) {
        Some((_, t)) => t.to_string(),
        None => {
            if let Some(stem) = cache.strip_suffix("_cache") {
                stem.to_string()
            } else if let Some(stem) = cache.strip_suffix('s') {
                stem.to_string()
            } else {
                cache.to_string()
            }
        }
    };
    let mut names = vec![format!("struct {base}"), format!("union {base}"), base];
    if !names.iter().any(|n| n == cache) {
        names.push(format!("struct {cache}"));
    }
    names
}

fn resolve_cache_type(cache: &mut SlabCache, symbols: &dyn SymbolSource) {
    for name in cache_type_names(&cache.name) {
        let Some(t) = symbols.type_by_name(&name) else {
            continue;
        };
        if !matches!(t.kind, DataTypeKind::Struct | DataTypeKind::Union) || t.size == 0 {
            continue;
        }
        // Objects are padded, never smaller than their type.
        if cache.object_size.is_some_and(|size| t.size > size) {
            continue;
        }
        cache.type_id = Some(t.id);
        cache.object_size.get_or_insert(t.size);
        return;
    }
}
