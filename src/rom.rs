//! ROM handling and the search-kernel seam.
//!
//! The hash primitive is opaque to the orchestration layers: a [`Kernel`]
//! takes `(rom, salt, start_nonce, target)` and answers found/not-found with
//! a nonce and counters. The software kernel below is the portable
//! implementation; accelerator backends plug in behind the same trait.
//!
//! Building a ROM takes seconds at production size, which is why workers
//! cache ROMs by key and dispatch prefers challenges whose ROM is already
//! resident.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::info;

const ROM_CHUNK: usize = 32;
const MIX_ROUNDS: usize = 8;

/// Precomputed lookup structure keyed by the challenge's `no_pre_mine` value.
pub struct Rom {
    key: String,
    data: Vec<u8>,
}

impl Rom {
    /// Deterministically expand `key` into `size` bytes of chained digests.
    pub fn build(key: &str, size: usize) -> Self {
        let started = Instant::now();
        let size = size.max(ROM_CHUNK * 2);
        let mut data = Vec::with_capacity(size);

        let mut block: [u8; 32] = Sha256::digest(key.as_bytes()).into();
        let mut counter: u64 = 0;
        while data.len() < size {
            let mut hasher = Sha256::new();
            hasher.update(block);
            hasher.update(counter.to_be_bytes());
            block = hasher.finalize().into();
            counter += 1;
            data.extend_from_slice(&block);
        }
        data.truncate(size);

        info!(
            "ROM built for {}... ({} MiB in {:.1}s)",
            &key[..key.len().min(8)],
            size / (1024 * 1024),
            started.elapsed().as_secs_f64()
        );
        Self {
            key: key.to_string(),
            data,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn window(&self, offset: usize) -> &[u8] {
        let offset = offset % (self.data.len() - ROM_CHUNK);
        &self.data[offset..offset + ROM_CHUNK]
    }
}

/// Hash one preimage against the ROM: a digest chain interleaved with
/// ROM reads at digest-derived offsets.
pub fn hash_preimage(rom: &Rom, preimage: &[u8]) -> [u8; 32] {
    let mut digest: [u8; 32] = Sha256::digest(preimage).into();
    for _ in 0..MIX_ROUNDS {
        let offset = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(rom.window(offset as usize));
        digest = hasher.finalize().into();
    }
    digest
}

/// One search assignment handed to a kernel.
pub struct SearchJob {
    pub salt_prefix: Vec<u8>,
    pub target: [u8; 32],
    pub start_nonce: u64,
    pub batch: u64,
    /// Compare only the leading 32 bits of the target. GPU kernels do this
    /// for speed; the coordinator re-validates against the full 256 bits.
    pub prefix_only: bool,
}

pub struct SearchOutcome {
    /// Winning nonce and its digest, when one was found.
    pub found: Option<(u64, String)>,
    pub hashes: u64,
    pub duration: f64,
}

/// The opaque search primitive.
pub trait Kernel: Send + Sync {
    fn search(&self, rom: &Rom, job: &SearchJob, stop: &AtomicBool) -> SearchOutcome;
}

/// Portable CPU implementation of the search primitive.
pub struct SoftwareKernel;

impl Kernel for SoftwareKernel {
    fn search(&self, rom: &Rom, job: &SearchJob, stop: &AtomicBool) -> SearchOutcome {
        let started = Instant::now();
        let mut preimage = Vec::with_capacity(16 + job.salt_prefix.len());
        let mut hashes = 0u64;

        for i in 0..job.batch {
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let nonce = job.start_nonce.wrapping_add(i);
            preimage.clear();
            preimage.extend_from_slice(format!("{:016x}", nonce).as_bytes());
            preimage.extend_from_slice(&job.salt_prefix);

            let digest = hash_preimage(rom, &preimage);
            hashes += 1;

            let meets_target = if job.prefix_only {
                digest[..4] <= job.target[..4]
            } else {
                digest[..] <= job.target[..]
            };
            if meets_target {
                return SearchOutcome {
                    found: Some((nonce, hex::encode(digest))),
                    hashes,
                    duration: started.elapsed().as_secs_f64(),
                };
            }
        }

        SearchOutcome {
            found: None,
            hashes,
            duration: started.elapsed().as_secs_f64(),
        }
    }
}

/// Small LRU of built ROMs, keyed by `rom_key`. Workers hold one each.
pub struct RomCache {
    capacity: usize,
    rom_size: usize,
    entries: HashMap<String, Arc<Rom>>,
    order: Vec<String>,
}

impl RomCache {
    pub fn new(capacity: usize, rom_size: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rom_size,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Arc<Rom>> {
        let rom = self.entries.get(key).map(Arc::clone)?;
        self.touch(key);
        Some(rom)
    }

    /// Insert an already-built ROM, evicting the least recently used entry
    /// when full. Lets callers run the expensive build off-thread.
    pub fn insert(&mut self, rom: Arc<Rom>) {
        if self.entries.contains_key(rom.key()) {
            return;
        }
        if self.entries.len() >= self.capacity {
            let evicted = self.order.remove(0);
            self.entries.remove(&evicted);
        }
        self.order.push(rom.key().to_string());
        self.entries.insert(rom.key().to_string(), rom);
    }

    pub fn get_or_build(&mut self, key: &str) -> Arc<Rom> {
        if let Some(rom) = self.get(key) {
            return rom;
        }
        let rom = Arc::new(Rom::build(key, self.rom_size));
        self.insert(Arc::clone(&rom));
        rom
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos);
            self.order.push(key);
        }
    }
}
