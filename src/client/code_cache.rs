//! Client code cache holding installed method bodies.
//!
//! Bodies are placed at increasing addresses, aligned to 16 bytes. Patching
//! a guard rewrites its five-byte site into a relative jump to the slow path.

use crate::core::ids::MethodId;
use crate::protocol::commit_data::PatchSite;
use hashbrown::HashMap;

pub const CODE_CACHE_BASE: u64 = 0x5000_0000;

const JMP_REL32: u8 = 0xe9;
const PATCH_SIZE: usize = 5;

/// Identity of an installed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(pub u32);

#[derive(Debug, Clone)]
pub struct InstalledBody {
    pub method: MethodId,
    pub start: u64,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub from_aot_cache: bool,
    /// Set when a pre-existence assumption of the body broke.
    pub needs_recompilation: bool,
    pub patched_sites: Vec<u64>,
}

impl InstalledBody {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.start + self.code.len() as u64
    }
}

#[derive(Debug)]
pub struct CodeCache {
    next_address: u64,
    next_id: u32,
    bodies: HashMap<BodyId, InstalledBody>,
    by_method: HashMap<MethodId, BodyId>,
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeCache {
    pub fn new() -> Self {
        Self {
            next_address: CODE_CACHE_BASE,
            next_id: 0,
            bodies: HashMap::new(),
            by_method: HashMap::new(),
        }
    }

    /// Address the next installed body will start at.
    pub fn next_start(&self) -> u64 {
        self.next_address
    }

    pub fn install(&mut self, method: MethodId, code: Vec<u8>, data: Vec<u8>, from_aot_cache: bool) -> BodyId {
        self.next_id += 1;
        let id = BodyId(self.next_id);
        let start = self.next_address;
        self.next_address = (start + code.len().max(1) as u64 + 15) & !15;
        log::debug!("installed {} at {:#x} ({} bytes)", method, start, code.len());
        self.bodies.insert(
            id,
            InstalledBody {
                method,
                start,
                code,
                data,
                from_aot_cache,
                needs_recompilation: false,
                patched_sites: Vec::new(),
            },
        );
        self.by_method.insert(method, id);
        id
    }

    /// Rewrite the guard at `site.location` into a jump to `site.destination`.
    ///
    /// Returns false if no installed body covers the site.
    pub fn patch(&mut self, site: PatchSite) -> bool {
        let Some(body) = self.bodies.values_mut().find(|b| b.contains(site.location)) else {
            return false;
        };
        let offset = (site.location - body.start) as usize;
        if offset + PATCH_SIZE > body.code.len() {
            return false;
        }
        let rel = site.destination.wrapping_sub(site.location + PATCH_SIZE as u64) as i64 as i32;
        body.code[offset] = JMP_REL32;
        body.code[offset + 1..offset + PATCH_SIZE].copy_from_slice(&rel.to_le_bytes());
        if !body.patched_sites.contains(&site.location) {
            body.patched_sites.push(site.location);
        }
        true
    }

    pub fn mark_for_recompilation(&mut self, id: BodyId) {
        if let Some(body) = self.bodies.get_mut(&id) {
            if !body.needs_recompilation {
                log::debug!("{} marked for recompilation", body.method);
            }
            body.needs_recompilation = true;
        }
    }

    pub fn remove(&mut self, id: BodyId) -> Option<InstalledBody> {
        let body = self.bodies.remove(&id)?;
        if self.by_method.get(&body.method) == Some(&id) {
            self.by_method.remove(&body.method);
        }
        Some(body)
    }

    pub fn body(&self, id: BodyId) -> Option<&InstalledBody> {
        self.bodies.get(&id)
    }

    /// Most recently installed body of `method`.
    pub fn body_of(&self, method: MethodId) -> Option<BodyId> {
        self.by_method.get(&method).copied()
    }

    pub fn installed_count(&self) -> usize {
        self.bodies.len()
    }
}
