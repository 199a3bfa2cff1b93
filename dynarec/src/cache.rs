//! Block cache and inter-block linking.
//!
//! Blocks are indexed by canonical guest PC in a `BTreeMap` — the
//! idiomatic Rust stand-in for the original's hand-rolled red-black
//! tree; both give ordered lookup with the same amortized cost for the
//! access pattern spec.md describes (infrequent inserts, frequent
//! lookups from the link trampoline).

use std::collections::BTreeMap;

use crate::runtime::PageTable;

/// Metadata for one compiled block. The host code itself lives in the
/// arena at `body_offset`; this struct is purely bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct BlockHandle {
    pub base_address: u32,
    /// Byte offset into the code arena of this block's first emitted
    /// instruction (the direct-jump and trampoline target).
    pub body_offset: usize,
    pub block_len_bytes: usize,
    pub psx_instructions: u32,
}

/// A pending or resolved cross-block edge. `patch_offset` is `None` for
/// an edge emitted as a direct jump to an already-compiled target (no
/// patching ever needed); `Some(offset)` marks a trampoline call site
/// whose placeholder jump still needs to be rewritten on first
/// resolution.
#[derive(Debug, Clone, Copy)]
pub struct LinkSite {
    pub source_block: u32,
    pub target_pc: u32,
    pub patch_offset: Option<usize>,
}

/// Keyed index of compiled blocks plus the bookkeeping the link
/// trampoline needs to patch call sites on first resolution.
pub struct BlockCache {
    blocks: BTreeMap<u32, BlockHandle>,
    /// Outstanding trampoline call sites, keyed by the guest PC they
    /// target, so a page invalidation can find every site that might
    /// need re-resolving once the page recompiles.
    pending_links: Vec<LinkSite>,
}

impl BlockCache {
    pub fn new() -> Self {
        BlockCache { blocks: BTreeMap::new(), pending_links: Vec::new() }
    }

    /// `find(pc)` from spec.md §4.5: the block whose `base_address ==
    /// pc`, or `None`.
    pub fn find(&self, pc: u32) -> Option<BlockHandle> {
        self.blocks.get(&pc).copied()
    }

    pub fn insert(&mut self, block: BlockHandle) {
        self.blocks.insert(block.base_address, block);
    }

    pub fn register_link(&mut self, site: LinkSite) {
        self.pending_links.push(site);
    }

    /// Drop every block whose `base_address` falls inside the given RAM
    /// page, per spec.md §4.5's invalidation contract. `ram_size` is
    /// needed to resolve RAM decode-mirror aliases the same way a guest
    /// store does. Also drops their recorded link sites: a stale
    /// trampoline patch pointing into a just-invalidated block must go
    /// through the trampoline again rather than jump directly to code
    /// that no longer exists.
    pub fn invalidate_page(&mut self, page: usize, ram_size: usize) {
        let stale: Vec<u32> = self
            .blocks
            .keys()
            .copied()
            .filter(|&pc| PageTable::tracked_page(pc, ram_size) == Some(page))
            .collect();
        for pc in &stale {
            self.blocks.remove(pc);
        }
        self.pending_links.retain(|site| PageTable::tracked_page(site.target_pc, ram_size) != Some(page));
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(pc: u32) -> BlockHandle {
        BlockHandle { base_address: pc, body_offset: pc as usize, block_len_bytes: 16, psx_instructions: 4 }
    }

    #[test]
    fn find_returns_exactly_the_inserted_block() {
        let mut cache = BlockCache::new();
        let b = handle(0x1000);
        cache.insert(b);
        let found = cache.find(0x1000).unwrap();
        assert_eq!(found.base_address, b.base_address);
    }

    #[test]
    fn find_or_compile_is_idempotent_across_repeat_lookups() {
        let mut cache = BlockCache::new();
        cache.insert(handle(0x2000));
        let first = cache.find(0x2000).unwrap();
        let second = cache.find(0x2000).unwrap();
        assert_eq!(first.body_offset, second.body_offset);
    }

    #[test]
    fn invalidate_page_drops_only_blocks_in_that_page() {
        let mut cache = BlockCache::new();
        let ram_size = 8192; // large enough that both addresses resolve to RAM (canonical < 4 * ram_size)
        cache.insert(handle(0)); // page 0
        cache.insert(handle(4096)); // page 2 (PAGE_SIZE_BYTES = 2048)
        cache.invalidate_page(0, ram_size);
        assert!(cache.find(0).is_none());
        assert!(cache.find(4096).is_some());
    }
}
