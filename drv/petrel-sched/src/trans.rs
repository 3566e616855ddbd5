// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation buffers: in-storage embedding lookup state.
//!
//! A lookup arrives as a configuration blob (attribute size, embedding
//! length, result/input embedding counts, table id, and a sorted list of
//! `(result, embedding_id)` pairs). The engine reformats the config into a
//! per-flash-page plan, gathers the pages through the embedding cache, the
//! LRU page buffer, or flash reads scheduled by the caller, and reduces
//! each page's embeddings into the result buffer by elementwise f32 sum.
//! Result sectors stream back to the host as soon as every embedding feeding
//! them has been reduced.
//!
//! Config and result storage are borrowed regions carved into
//! [`TRANS_BUF_ENTRY_NUM`] fixed-size per-entry slices, mirroring the
//! dedicated RAM ranges they occupy in the memory map.

use drv_petrel_flash_api::{PAGE_BYTES, SECTOR_BYTES, SECTORS_PER_PAGE};
use drv_petrel_hostdma_api::{DmaSnapshot, HostDma};
use embed_cache::{CacheSlot, EmbedCache, VECTOR_LANES};
use heapless::Deque;
use heapless::Vec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::rq::LinkedRing;

/// Translation buffer entries.
pub const TRANS_BUF_ENTRY_NUM: usize = 8;

/// Config region bytes per entry (a config write is at most 256 sectors).
pub const TRANS_CONFIG_BYTES: usize = 256 * SECTOR_BYTES;

/// Result sectors per entry.
pub const RESULT_SECTORS_PER_ENTRY: usize = 256;

/// Result region f32 lanes per entry.
pub const RESULT_LANES_PER_ENTRY: usize =
    RESULT_SECTORS_PER_ENTRY * SECTOR_BYTES / 4;

/// Per-entry page plan capacity.
pub const MAX_REQUEST_PAGES: usize = 256;

/// Node pool depth of the read-return queue: each entry can have several
/// translation reads outstanding (the host splits large returns).
pub const TRANS_READ_RQ_DEPTH: usize = TRANS_BUF_ENTRY_NUM * 16;

/// Sector stride between embedding tables; `slba % stride` identifies a
/// request within its table.
pub const TABLE_SECTOR_STRIDE: u32 = 1000;

/// The leading fields of a lookup configuration blob.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C)]
pub struct LookupHeader {
    pub attribute_size: u32,
    pub embedding_length: u32,
    pub result_embeddings: u32,
    pub input_embeddings: u32,
    pub table_id: u32,
}

/// One `(result, embedding_id)` pair; the blob carries `input_embeddings`
/// of these after the header, sorted by `embedding_id`.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C)]
pub struct EmbeddingPair {
    pub result: u32,
    pub embedding_id: u32,
}

const HEADER_BYTES: usize = core::mem::size_of::<LookupHeader>();
const PAIR_BYTES: usize = core::mem::size_of::<EmbeddingPair>();

/// One slot of an entry's page plan: a flash page and the run of config
/// pairs it satisfies.
#[derive(Copy, Clone, Debug)]
pub struct PagePlan {
    pub slba: u32,
    pub first_pair: u32,
    pub pair_count: u32,
}

/// Count-based statistics, returned and reset by flush.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransStats {
    pub requests: u32,
    pub pages: u32,
    pub sectors: u32,
    pub cache_hits: u32,
    pub cache_misses: u32,
}

/// One translation buffer entry.
pub struct TransEntry {
    slba: u32,
    request_id: u16,
    nlb: u16,
    nlb_requested: u16,
    nlb_completed: u16,
    pages_translated: u16,
    configured: bool,
    allocated: bool,
    rx_dma: Option<DmaSnapshot>,
    plan: Vec<PagePlan, MAX_REQUEST_PAGES>,
    sector_input: [u16; RESULT_SECTORS_PER_ENTRY],
    sector_done: [u16; RESULT_SECTORS_PER_ENTRY],
}

impl TransEntry {
    fn new() -> Self {
        Self {
            slba: 0,
            request_id: 0,
            nlb: 0,
            nlb_requested: 0,
            nlb_completed: 0,
            pages_translated: 0,
            configured: false,
            allocated: false,
            rx_dma: None,
            plan: Vec::new(),
            sector_input: [0; RESULT_SECTORS_PER_ENTRY],
            sector_done: [0; RESULT_SECTORS_PER_ENTRY],
        }
    }

    pub fn slba(&self) -> u32 {
        self.slba
    }

    pub fn nlb(&self) -> u16 {
        self.nlb
    }

    pub fn nlb_requested(&self) -> u16 {
        self.nlb_requested
    }

    pub fn nlb_completed(&self) -> u16 {
        self.nlb_completed
    }

    pub fn configured(&self) -> bool {
        self.configured
    }

    pub fn allocated(&self) -> bool {
        self.allocated
    }

    pub fn n_pages(&self) -> u16 {
        self.plan.len() as u16
    }

    pub fn plan(&self, page_idx: u16) -> &PagePlan {
        &self.plan[page_idx as usize]
    }

    pub fn pages_translated(&self) -> u16 {
        self.pages_translated
    }

    /// Whether result sector `s` has every contributing embedding reduced.
    pub fn sector_ready(&self, s: u16) -> bool {
        self.sector_done[s as usize] >= self.sector_input[s as usize]
    }

    pub fn set_rx_dma(&mut self, snap: DmaSnapshot) {
        self.rx_dma = Some(snap);
    }

    pub fn add_requested(&mut self, nlb: u16) {
        self.nlb_requested += nlb;
    }
}

/// Item carried by the config-processing queue.
#[derive(Copy, Clone, Debug)]
pub struct TransRqItem {
    pub entry: u8,
    pub next_page: u16,
}

/// Item carried by the read-return queue.
#[derive(Copy, Clone, Debug)]
pub struct TransReadItem {
    pub entry: u8,
    pub first_sector: u16,
    pub next_sector: u16,
    pub nlb: u16,
    pub cmd_slot_tag: u16,
}

/// The translation engine state: the entry pool, its two request queues,
/// the embedding cache, and the borrowed config/result regions.
pub struct TransEngine<'m> {
    entries: [TransEntry; TRANS_BUF_ENTRY_NUM],
    avail: Deque<u8, TRANS_BUF_ENTRY_NUM>,
    config: &'m mut [u8],
    results: &'m mut [f32],
    cache: EmbedCache<'m>,
    pub(crate) rq: LinkedRing<TransRqItem, TRANS_BUF_ENTRY_NUM>,
    pub(crate) read_rq: LinkedRing<TransReadItem, TRANS_READ_RQ_DEPTH>,
    stats: TransStats,
}

impl<'m> TransEngine<'m> {
    /// Builds the engine over its backing regions.
    ///
    /// `config` must hold [`TRANS_CONFIG_BYTES`] and `results`
    /// [`RESULT_LANES_PER_ENTRY`] per entry; `cache_slots` must be a nonzero
    /// power of two.
    pub fn new(
        cache_slots: &'m mut [CacheSlot],
        config: &'m mut [u8],
        results: &'m mut [f32],
    ) -> Self {
        assert_eq!(config.len(), TRANS_BUF_ENTRY_NUM * TRANS_CONFIG_BYTES);
        assert_eq!(results.len(), TRANS_BUF_ENTRY_NUM * RESULT_LANES_PER_ENTRY);
        let mut avail = Deque::new();
        for i in 0..TRANS_BUF_ENTRY_NUM as u8 {
            avail.push_back(i).ok();
        }
        Self {
            entries: core::array::from_fn(|_| TransEntry::new()),
            avail,
            config,
            results,
            cache: EmbedCache::new(cache_slots),
            rq: LinkedRing::new(TransRqItem {
                entry: 0,
                next_page: 0,
            }),
            read_rq: LinkedRing::new(TransReadItem {
                entry: 0,
                first_sector: 0,
                next_sector: 0,
                nlb: 0,
                cmd_slot_tag: 0,
            }),
            stats: TransStats::default(),
        }
    }

    pub fn entry(&self, idx: u8) -> &TransEntry {
        &self.entries[idx as usize]
    }

    pub fn entry_mut(&mut self, idx: u8) -> &mut TransEntry {
        &mut self.entries[idx as usize]
    }

    pub fn stats(&self) -> &TransStats {
        &self.stats
    }

    pub fn take_stats(&mut self) -> TransStats {
        core::mem::take(&mut self.stats)
    }

    /// Claims a free entry for a new lookup. The frontend must back-pressure
    /// before the pool empties; running dry is fatal.
    pub fn allocate(&mut self, slba: u32, request_id: u16) -> u8 {
        let idx = match self.avail.pop_front() {
            Some(idx) => idx,
            None => panic!("translation buffer pool exhausted"),
        };
        let e = &mut self.entries[idx as usize];
        e.slba = slba;
        e.request_id = request_id;
        e.configured = false;
        e.allocated = true;
        e.rx_dma = None;
        e.nlb = 0;
        e.nlb_requested = 0;
        e.nlb_completed = 0;
        e.pages_translated = 0;
        e.plan.clear();
        idx
    }

    fn deallocate(&mut self, idx: u8) {
        let e = &mut self.entries[idx as usize];
        e.allocated = false;
        e.configured = false;
        self.avail.push_back(idx).ok();
        self.stats.requests += 1;
    }

    /// Finds the live entry serving `request_id`. A read for an unknown
    /// request is a frontend protocol violation and fatal.
    pub fn find(&self, request_id: u16) -> u8 {
        for (i, e) in self.entries.iter().enumerate() {
            if e.allocated && e.request_id == request_id {
                return i as u8;
            }
        }
        panic!("no translation entry for request id");
    }

    /// One sector of an entry's config region, as an RX DMA target.
    pub fn config_sector_mut(&mut self, idx: u8, sector: u16) -> &mut [u8] {
        let base = idx as usize * TRANS_CONFIG_BYTES
            + sector as usize * SECTOR_BYTES;
        &mut self.config[base..base + SECTOR_BYTES]
    }

    fn config_region(&self, idx: u8) -> &[u8] {
        &self.config[idx as usize * TRANS_CONFIG_BYTES..][..TRANS_CONFIG_BYTES]
    }

    fn header(&self, idx: u8) -> LookupHeader {
        let region = self.config_region(idx);
        match LookupHeader::read_from_prefix(region) {
            Ok((h, _)) => h,
            Err(_) => unreachable!(),
        }
    }

    fn pair(&self, idx: u8, i: u32) -> EmbeddingPair {
        let region = self.config_region(idx);
        let at = HEADER_BYTES + i as usize * PAIR_BYTES;
        match EmbeddingPair::read_from_bytes(&region[at..at + PAIR_BYTES]) {
            Ok(p) => p,
            Err(_) => unreachable!(),
        }
    }

    /// If the entry's config RX DMA has fully landed, processes the config
    /// and reports true.
    pub fn check_config_dma(&mut self, idx: u8, dma: &dyn HostDma) -> bool {
        if let Some(snap) = self.entries[idx as usize].rx_dma {
            if dma.rx_partial_done(snap) {
                self.entries[idx as usize].rx_dma = None;
                self.configure(idx);
                return true;
            }
        }
        false
    }

    /// Reformats the config blob into the per-page plan, serving what it
    /// can from the embedding cache.
    ///
    /// The result region is zeroed before the walk so cache hits accumulate
    /// onto clean sectors; the reduction is a deterministic left-to-right
    /// sum whether an embedding comes from cache or flash.
    pub fn configure(&mut self, idx: u8) {
        let header = self.header(idx);
        assert_eq!(header.attribute_size, 4, "attributes must be f32");
        let len = header.embedding_length as usize;
        assert!(len <= VECTOR_LANES);
        let row_bytes = header.attribute_size * header.embedding_length;

        let result_base = idx as usize * RESULT_LANES_PER_ENTRY;
        let result_lanes = header.result_embeddings as usize * len;
        for lane in &mut self.results[result_base..result_base + result_lanes]
        {
            *lane = 0.0;
        }

        let nlb = (header.result_embeddings * row_bytes)
            .div_ceil(SECTOR_BYTES as u32) as u16;
        {
            let e = &mut self.entries[idx as usize];
            e.nlb = nlb;
            e.plan.clear();
            for s in 0..nlb as usize {
                e.sector_input[s] = 0;
                e.sector_done[s] = 0;
            }
        }

        // Each plan slot covers one page and a consecutive run of *missed*
        // pairs; a cache hit closes the open run so the page pass never
        // re-reduces an embedding the cache already contributed.
        let entry_slba = self.entries[idx as usize].slba;
        let mut open: Option<PagePlan> = None;
        let mut page_id = 0;
        let mut cur_len: u32 = 0;

        for i in 0..header.input_embeddings {
            let pair = self.pair(idx, i);
            let result_sector =
                (pair.result * row_bytes / SECTOR_BYTES as u32) as usize;

            let cached =
                self.cache.probe(pair.embedding_id, header.table_id).copied();
            if let Some(vector) = cached {
                let at = result_base + pair.result as usize * len;
                accumulate(&mut self.results[at..at + len], &vector[..len]);
                self.stats.cache_hits += 1;
                if let Some(mut slot) = open.take() {
                    slot.pair_count = cur_len;
                    self.push_plan_slot(idx, slot);
                    cur_len = 0;
                }
                continue;
            }
            self.stats.cache_misses += 1;

            self.entries[idx as usize].sector_input[result_sector] += 1;

            let cur_page = pair.embedding_id * row_bytes / PAGE_BYTES as u32;
            if open.is_none() || cur_page != page_id {
                if let Some(mut slot) = open.take() {
                    slot.pair_count = cur_len;
                    self.push_plan_slot(idx, slot);
                }
                open = Some(PagePlan {
                    slba: entry_slba + cur_page * SECTORS_PER_PAGE as u32,
                    first_pair: i,
                    pair_count: 0,
                });
                cur_len = 0;
            }
            page_id = cur_page;
            cur_len += 1;
        }
        if let Some(mut slot) = open.take() {
            slot.pair_count = cur_len;
            self.push_plan_slot(idx, slot);
        }
        // A lookup served entirely from cache still carries one (empty)
        // slot for its first page, so a configured entry always has a page
        // plan.
        if self.entries[idx as usize].plan.is_empty() {
            let first_page =
                self.pair(idx, 0).embedding_id * row_bytes / PAGE_BYTES as u32;
            let slot = PagePlan {
                slba: entry_slba + first_page * SECTORS_PER_PAGE as u32,
                first_pair: 0,
                pair_count: 0,
            };
            self.push_plan_slot(idx, slot);
        }
        self.entries[idx as usize].configured = true;
    }

    fn push_plan_slot(&mut self, idx: u8, slot: PagePlan) {
        if self.entries[idx as usize].plan.push(slot).is_err() {
            panic!("lookup spans too many pages");
        }
    }

    /// Reduces one gathered flash page into the result buffer.
    ///
    /// `page` is the raw page image; the plan slot names the run of config
    /// pairs it satisfies. Each embedding is write-allocated into the cache
    /// and then summed into its result vector.
    pub fn translate_page(&mut self, idx: u8, page: &[u8], page_idx: u16) {
        let header = self.header(idx);
        let len = header.embedding_length as usize;
        let row_bytes = header.attribute_size * header.embedding_length;
        let plan = self.entries[idx as usize].plan[page_idx as usize];
        let base_id = (plan.slba - self.entries[idx as usize].slba)
            * SECTOR_BYTES as u32
            / row_bytes;
        let result_base = idx as usize * RESULT_LANES_PER_ENTRY;

        let mut lanes = [0.0f32; VECTOR_LANES];
        for k in 0..plan.pair_count {
            let pair = self.pair(idx, plan.first_pair + k);
            let offset = (pair.embedding_id - base_id) as usize;
            read_lanes(&mut lanes[..len], page, offset * len);

            self.cache.insert(
                pair.embedding_id,
                header.table_id,
                &lanes[..len],
            );

            let at = result_base + pair.result as usize * len;
            accumulate(&mut self.results[at..at + len], &lanes[..len]);

            let result_sector =
                (pair.result * row_bytes / SECTOR_BYTES as u32) as usize;
            self.entries[idx as usize].sector_done[result_sector] += 1;
        }

        self.entries[idx as usize].pages_translated += 1;
        self.stats.pages += 1;
    }

    /// Ships consecutive ready result sectors starting at `next_sector`,
    /// one TX DMA each, stopping at the first sector still missing
    /// embeddings. Returns the number shipped; frees the entry when its
    /// last sector goes out.
    pub fn read_translated_sectors(
        &mut self,
        idx: u8,
        first_sector: u16,
        next_sector: u16,
        count: u16,
        cmd_slot_tag: u16,
        dma: &mut dyn HostDma,
    ) -> u16 {
        if !self.entries[idx as usize].configured {
            return 0;
        }
        let mut shipped = 0;
        for s in 0..count {
            let cur = next_sector + s;
            let e = &mut self.entries[idx as usize];
            if e.sector_done[cur as usize] < e.sector_input[cur as usize] {
                return shipped;
            }
            e.sector_done[cur as usize] = 0;
            shipped += 1;

            let lane = idx as usize * RESULT_LANES_PER_ENTRY
                + cur as usize * (SECTOR_BYTES / 4);
            dma.set_auto_tx_dma(
                cmd_slot_tag,
                (cur - first_sector) as u8,
                self.results[lane..lane + SECTOR_BYTES / 4].as_bytes(),
            );
            self.stats.sectors += 1;

            let e = &mut self.entries[idx as usize];
            e.nlb_completed += 1;
            if e.nlb_completed == e.nlb {
                self.deallocate(idx);
            }
        }
        shipped
    }
}

/// Left-to-right elementwise sum into `into`.
fn accumulate(into: &mut [f32], from: &[f32]) {
    for (dst, src) in into.iter_mut().zip(from) {
        *dst += *src;
    }
}

/// Loads little-endian f32 lanes from a page image starting at lane
/// `first_lane`.
fn read_lanes(into: &mut [f32], page: &[u8], first_lane: usize) {
    let base = first_lane * 4;
    for (k, lane) in into.iter_mut().enumerate() {
        let at = base + k * 4;
        *lane = f32::from_le_bytes([
            page[at],
            page[at + 1],
            page[at + 2],
            page[at + 3],
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_petrel_hostdma_api::DmaSnapshot;

    /// DMA stub that records TX sectors and reports everything done.
    #[derive(Default)]
    struct NullDma {
        tx: std::vec::Vec<(u16, u8, std::vec::Vec<u8>)>,
    }

    impl HostDma for NullDma {
        fn set_auto_rx_dma(&mut self, _: u16, _: u8, _: &mut [u8]) {}
        fn set_auto_tx_dma(&mut self, tag: u16, idx: u8, src: &[u8]) {
            self.tx.push((tag, idx, src.to_vec()));
        }
        fn rx_snapshot(&self) -> DmaSnapshot {
            DmaSnapshot {
                tail: 0,
                overflow: 0,
            }
        }
        fn tx_snapshot(&self) -> DmaSnapshot {
            DmaSnapshot {
                tail: 0,
                overflow: 0,
            }
        }
        fn rx_partial_done(&self, _: DmaSnapshot) -> bool {
            true
        }
        fn tx_partial_done(&self, _: DmaSnapshot) -> bool {
            true
        }
    }

    struct Backing {
        cache: std::vec::Vec<CacheSlot>,
        config: std::vec::Vec<u8>,
        results: std::vec::Vec<f32>,
    }

    impl Backing {
        fn new() -> Self {
            Self {
                cache: vec![CacheSlot::EMPTY; 1024],
                config: vec![0; TRANS_BUF_ENTRY_NUM * TRANS_CONFIG_BYTES],
                results: vec![
                    0.0;
                    TRANS_BUF_ENTRY_NUM * RESULT_LANES_PER_ENTRY
                ],
            }
        }

        fn engine(&mut self) -> TransEngine<'_> {
            TransEngine::new(
                self.cache.as_mut_slice(),
                self.config.as_mut_slice(),
                self.results.as_mut_slice(),
            )
        }
    }

    fn write_config(
        engine: &mut TransEngine<'_>,
        idx: u8,
        len: u32,
        result_embeddings: u32,
        table_id: u32,
        pairs: &[(u32, u32)],
    ) {
        let header = LookupHeader {
            attribute_size: 4,
            embedding_length: len,
            result_embeddings,
            input_embeddings: pairs.len() as u32,
            table_id,
        };
        let mut blob = std::vec::Vec::new();
        blob.extend_from_slice(header.as_bytes());
        for &(result, id) in pairs {
            blob.extend_from_slice(
                EmbeddingPair {
                    result,
                    embedding_id: id,
                }
                .as_bytes(),
            );
        }
        for (i, chunk) in blob.chunks(SECTOR_BYTES).enumerate() {
            engine.config_sector_mut(idx, i as u16)[..chunk.len()]
                .copy_from_slice(chunk);
        }
    }

    /// Builds a fake page image holding rows `base_id..` of an embedding
    /// table where row `id` is `[id, id, ...]`.
    fn page_image(base_id: u32, len: usize) -> std::vec::Vec<u8> {
        let mut page = vec![0u8; PAGE_BYTES];
        let rows = PAGE_BYTES / (len * 4);
        for r in 0..rows {
            let value = (base_id + r as u32) as f32;
            for k in 0..len {
                let at = (r * len + k) * 4;
                page[at..at + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
        page
    }

    #[test]
    fn configure_builds_page_plan() {
        let mut backing = Backing::new();
        let mut engine = backing.engine();
        let idx = engine.allocate(0, 1);
        // len=32 lanes, 128B rows: 128 rows per page. Pairs touch pages 0,
        // 0, 1, 3.
        write_config(
            &mut engine,
            idx,
            32,
            2,
            0,
            &[(0, 5), (0, 100), (1, 130), (1, 400)],
        );
        engine.configure(idx);

        let e = engine.entry(idx);
        assert!(e.configured());
        // 2 result embeddings * 128B = 256B -> 1 sector.
        assert_eq!(e.nlb(), 1);
        assert_eq!(e.n_pages(), 3);
        assert_eq!(e.plan(0).slba, 0);
        assert_eq!(e.plan(0).pair_count, 2);
        assert_eq!(e.plan(1).slba, SECTORS_PER_PAGE as u32);
        assert_eq!(e.plan(1).pair_count, 1);
        assert_eq!(e.plan(2).slba, 3 * SECTORS_PER_PAGE as u32);
        assert_eq!(e.plan(2).pair_count, 1);
        assert_eq!(engine.stats().cache_misses, 4);
    }

    #[test]
    fn translate_reduces_and_fills_cache() {
        let mut backing = Backing::new();
        let mut engine = backing.engine();
        let idx = engine.allocate(0, 1);
        write_config(&mut engine, idx, 32, 1, 2, &[(0, 5), (0, 9)]);
        engine.configure(idx);
        assert!(!engine.entry(idx).sector_ready(0));

        let page = page_image(0, 32);
        engine.translate_page(idx, &page, 0);

        let e = engine.entry(idx);
        assert_eq!(e.pages_translated(), 1);
        assert!(e.sector_ready(0));
        // Rows 5 and 9 summed: every lane is 14.0.
        let lane = engine.results[0];
        assert_eq!(lane, 14.0);
        // Both rows are now cached under table 2.
        assert!(engine.cache.probe(5, 2).is_some());
        assert!(engine.cache.probe(9, 2).is_some());
        assert!(engine.cache.probe(5, 3).is_none());
    }

    #[test]
    fn cache_hits_short_circuit_second_lookup() {
        let mut backing = Backing::new();
        let mut engine = backing.engine();
        let idx = engine.allocate(0, 1);
        write_config(&mut engine, idx, 32, 1, 0, &[(0, 3), (0, 7)]);
        engine.configure(idx);
        let page = page_image(0, 32);
        engine.translate_page(idx, &page, 0);
        let flash_sum = engine.results[0];
        let mut dma = NullDma::default();
        engine.read_translated_sectors(idx, 0, 0, 1, 0, &mut dma);
        assert!(!engine.entry(idx).allocated());

        // Same lookup again: both embeddings come from cache, no pairs miss,
        // and the plan degenerates to one empty page slot.
        let idx2 = engine.allocate(0, 2);
        write_config(&mut engine, idx2, 32, 1, 0, &[(0, 3), (0, 7)]);
        engine.configure(idx2);
        assert_eq!(engine.stats().cache_hits, 2);
        let e = engine.entry(idx2);
        assert_eq!(e.n_pages(), 1);
        assert_eq!(e.plan(0).pair_count, 0);
        assert!(e.sector_ready(0));
        // Identical sum, served from cache.
        let cached_sum = engine.results[idx2 as usize * RESULT_LANES_PER_ENTRY];
        assert_eq!(cached_sum, flash_sum);
    }

    #[test]
    fn sectors_ship_in_order_and_free_the_entry() {
        let mut backing = Backing::new();
        let mut engine = backing.engine();
        let idx = engine.allocate(0, 1);
        // 64 results of 32 lanes = 2 sectors; inputs: sector 0 gets row 1,
        // sector 1 gets row 40 (result 32 -> byte 4096).
        write_config(&mut engine, idx, 32, 64, 0, &[(0, 1), (32, 40)]);
        engine.configure(idx);
        assert_eq!(engine.entry(idx).nlb(), 2);

        let mut dma = NullDma::default();
        // Nothing translated yet: nothing ships.
        assert_eq!(
            engine.read_translated_sectors(idx, 0, 0, 2, 9, &mut dma),
            0
        );

        let page = page_image(0, 32);
        engine.translate_page(idx, &page, 0);
        let shipped = engine.read_translated_sectors(idx, 0, 0, 2, 9, &mut dma);
        assert_eq!(shipped, 2);
        assert_eq!(dma.tx.len(), 2);
        assert_eq!(dma.tx[0].1, 0);
        assert_eq!(dma.tx[1].1, 1);
        // Sector 0 carries row 1 in its first lanes.
        let b = &dma.tx[0].2;
        assert_eq!(
            f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            1.0
        );
        assert!(!engine.entry(idx).allocated());
        assert_eq!(engine.stats().requests, 1);
        assert_eq!(engine.stats().sectors, 2);
    }

    #[test]
    fn partial_return_stops_at_unready_sector() {
        let mut backing = Backing::new();
        let mut engine = backing.engine();
        let idx = engine.allocate(0, 1);
        // Sector 0 fed by page 0, sector 1 fed by page 40 (row 5120).
        write_config(&mut engine, idx, 32, 64, 0, &[(0, 1), (32, 5120)]);
        engine.configure(idx);
        assert_eq!(engine.entry(idx).n_pages(), 2);

        let page = page_image(0, 32);
        engine.translate_page(idx, &page, 0);

        let mut dma = NullDma::default();
        let shipped = engine.read_translated_sectors(idx, 0, 0, 2, 9, &mut dma);
        assert_eq!(shipped, 1);
        assert!(engine.entry(idx).allocated());
        assert_eq!(engine.entry(idx).nlb_completed(), 1);

        // Page 40 lands; the remaining sector ships and the entry frees.
        let page = page_image(5120, 32);
        engine.translate_page(idx, &page, 1);
        let shipped = engine.read_translated_sectors(idx, 0, 1, 1, 9, &mut dma);
        assert_eq!(shipped, 1);
        assert!(!engine.entry(idx).allocated());
    }

    #[test]
    fn interleaved_cache_hit_splits_plan_runs() {
        let mut backing = Backing::new();
        let mut engine = backing.engine();

        // Prime the cache with row 7 via a first lookup.
        let first = engine.allocate(0, 1);
        write_config(&mut engine, first, 32, 1, 0, &[(0, 7)]);
        engine.configure(first);
        engine.translate_page(first, &page_image(0, 32), 0);
        let mut dma = NullDma::default();
        engine.read_translated_sectors(first, 0, 0, 1, 0, &mut dma);

        // Rows 5, 7, 9 all live on page 0, but row 7 is served from cache,
        // so the plan must split into two runs that exclude it.
        let idx = engine.allocate(0, 2);
        write_config(&mut engine, idx, 32, 1, 0, &[(0, 5), (0, 7), (0, 9)]);
        engine.configure(idx);
        let e = engine.entry(idx);
        assert_eq!(e.n_pages(), 2);
        assert_eq!((e.plan(0).first_pair, e.plan(0).pair_count), (0, 1));
        assert_eq!((e.plan(1).first_pair, e.plan(1).pair_count), (2, 1));

        let page = page_image(0, 32);
        engine.translate_page(idx, &page, 0);
        engine.translate_page(idx, &page, 1);
        assert!(engine.entry(idx).sector_ready(0));
        // 5 + 7 + 9, each contributing exactly once.
        let base = idx as usize * RESULT_LANES_PER_ENTRY;
        assert_eq!(engine.results[base], 21.0);
    }

    #[test]
    #[should_panic(expected = "translation buffer pool exhausted")]
    fn pool_exhaustion_is_fatal() {
        let mut backing = Backing::new();
        let mut engine = backing.engine();
        for i in 0..=TRANS_BUF_ENTRY_NUM as u16 {
            engine.allocate(0, i);
        }
    }
}
