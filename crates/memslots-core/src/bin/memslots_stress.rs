//! Readers-vs-writer torture test for the slot table.
//!
//! Reader threads translate random guest frames and write guest memory
//! while one writer creates, moves and deletes a slot in a loop and a
//! reclaimer keeps evicting host pages.  Every reader snapshot is checked
//! for a torn table: a slot with a geometry no request ever asked for,
//! two overlapping user slots, or a generation going backwards.
//!
//! Usage:
//!   cargo run --release --bin memslots_stress -- --readers 8 --cycles 5000
//!   cargo run --release --bin memslots_stress -- --config mem.json --seed 7

use std::fs;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use log::{error, info};
use memslots_abi::{UserMemoryRegion, MEM_LOG_DIRTY_PAGES, PAGE_SIZE};
use memslots_core::arch::{ArchMemory, SoftMmu};
use memslots_core::config::MemoryConfig;
use memslots_core::host::SimulatedHost;
use memslots_core::kvm::KvmMirror;
use memslots_core::memslot::Memslots;
use memslots_core::requests::CountingKicker;
use memslots_core::translate::{TranslateError, TranslateRequest};
use memslots_core::vm::{VmError, VmMemory};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

const HOST_BASE: u64 = 0x7f00_0000_0000;
const HOST_LEN: usize = 4 << 20;

/// Slot 0: always present.
const STABLE_GFN: u64 = 0;
const STABLE_PAGES: u64 = 64;

/// Slot 1: created, moved and deleted by the writer.
const MOVING_BASES: [u64; 2] = [0x100, 0x200];
const MOVING_PAGES: u64 = 64;
const GFN_LIMIT: u64 = 0x240;

#[derive(Parser)]
#[command(name = "memslots_stress")]
#[command(about = "Concurrent translation vs. slot-table churn")]
#[command(version)]
struct Cli {
    /// Reader threads.
    #[arg(short, long, default_value = "4")]
    readers: usize,

    /// Create/move/delete cycles run by the writer.
    #[arg(short, long, default_value = "1000")]
    cycles: u64,

    /// Random seed for reproducibility.
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// JSON memory config (defaults apply to missing fields).
    #[arg(long)]
    config: Option<String>,
}

#[derive(Default)]
struct Counters {
    snapshots: AtomicU64,
    translated: AtomicU64,
    unmapped: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    torn: AtomicU64,
}

fn region(slot: u32, gfn: u64, npages: u64, flags: u32) -> UserMemoryRegion {
    UserMemoryRegion::new(slot, gfn * PAGE_SIZE, npages * PAGE_SIZE, HOST_BASE + gfn * PAGE_SIZE)
        .with_flags(flags)
}

/// True if `slots` could have been published by the writer.
fn consistent(slots: &Memslots) -> bool {
    let present: Vec<_> = slots.iter().collect();
    for (i, a) in present.iter().enumerate() {
        for b in &present[i + 1..] {
            if a.base_gfn() < b.end_gfn() && b.base_gfn() < a.end_gfn() {
                return false;
            }
        }
    }
    let stable_ok = slots
        .get(0)
        .is_some_and(|s| s.base_gfn() == STABLE_GFN && s.npages() == STABLE_PAGES);
    let moving_ok = slots.get(1).filter(|s| s.is_present()).map_or(true, |s| {
        MOVING_BASES.contains(&s.base_gfn())
            && s.npages() == MOVING_PAGES
            && s.userspace_addr() == HOST_BASE + s.base_gfn() * PAGE_SIZE
    });
    stable_ok && moving_ok
}

fn reader(vm: &VmMemory, soft: &SoftMmu, seed: u64, stop: &AtomicBool, counters: &Counters) {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut last_generation = 0;
    while !stop.load(Ordering::Relaxed) {
        {
            let guard = vm.read_lock();
            let slots = vm.memslots(&guard);
            if !consistent(slots) || slots.generation() < last_generation {
                error!("torn table at generation {}", slots.generation());
                counters.torn.fetch_add(1, Ordering::Relaxed);
            }
            last_generation = slots.generation();
            counters.snapshots.fetch_add(1, Ordering::Relaxed);
        }

        let gfn = rng.gen_range(0..GFN_LIMIT);
        let req = if rng.gen_bool(0.5) {
            TranslateRequest::write()
        } else {
            TranslateRequest::read()
        };
        match vm.map_gfn(gfn, req, |f| soft.install(f.gfn(), f.pfn(), f.writable())) {
            Ok(()) => counters.translated.fetch_add(1, Ordering::Relaxed),
            Err(TranslateError::NoMapping { .. }) => counters.unmapped.fetch_add(1, Ordering::Relaxed),
            Err(e) => {
                error!("gfn {gfn:#x}: {e}");
                counters.torn.fetch_add(1, Ordering::Relaxed)
            }
        };

        let gpa = rng.gen_range(0..STABLE_PAGES * PAGE_SIZE - 8);
        if vm.write_guest(gpa, &rng.gen::<u64>().to_le_bytes()).is_ok() {
            counters.writes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn reclaimer(host: &SimulatedHost, seed: u64, stop: &AtomicBool, counters: &Counters) {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    while !stop.load(Ordering::Relaxed) {
        let gfn = rng.gen_range(0..GFN_LIMIT);
        host.swap_out(HOST_BASE + gfn * PAGE_SIZE);
        counters.evictions.fetch_add(1, Ordering::Relaxed);
        thread::yield_now();
    }
}

fn writer(vm: &VmMemory, cycles: u64, seed: u64) -> Result<(), VmError> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    for _ in 0..cycles {
        let flags = if rng.gen_bool(0.5) { MEM_LOG_DIRTY_PAGES } else { 0 };
        let first = rng.gen_range(0..MOVING_BASES.len());
        vm.set_user_region(&region(1, MOVING_BASES[first], MOVING_PAGES, flags))?;
        if rng.gen_bool(0.5) {
            let other = MOVING_BASES[1 - first];
            vm.set_user_region(&region(1, other, MOVING_PAGES, flags))?;
        }
        vm.set_user_region(&UserMemoryRegion::delete(1))?;
    }
    Ok(())
}

fn build_vm(
    config: MemoryConfig,
    host: Arc<SimulatedHost>,
    soft: Arc<SoftMmu>,
) -> Result<Arc<VmMemory>, VmError> {
    let arch: Arc<dyn ArchMemory> = if config.mirror_to_kvm {
        let resolver = Arc::clone(&host);
        Arc::new(KvmMirror::new(soft, Box::new(move |hva| resolver.host_address(hva)))?)
    } else {
        soft
    };
    VmMemory::with_kicker(config, host, arch, Arc::new(CountingKicker::new()))
}

fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => MemoryConfig::from_json(&fs::read_to_string(path)?)?,
        None => MemoryConfig::default(),
    };
    let host = Arc::new(SimulatedHost::new(&[(HOST_BASE, HOST_LEN)])?);
    let soft = Arc::new(SoftMmu::new());
    let vm = build_vm(config, Arc::clone(&host), Arc::clone(&soft))?;
    vm.set_user_region(&region(0, STABLE_GFN, STABLE_PAGES, MEM_LOG_DIRTY_PAGES))?;

    info!(
        "{} readers, {} cycles, seed {}",
        cli.readers, cli.cycles, cli.seed
    );
    let counters = Counters::default();
    let stop = AtomicBool::new(false);
    let start = Instant::now();

    let written = thread::scope(|s| {
        for i in 0..cli.readers {
            let (vm, soft, stop, counters) = (&vm, &soft, &stop, &counters);
            s.spawn(move || reader(vm, soft, cli.seed.wrapping_add(1 + i as u64), stop, counters));
        }
        s.spawn(|| reclaimer(&host, cli.seed.wrapping_sub(1), &stop, &counters));
        let result = writer(&vm, cli.cycles, cli.seed);
        stop.store(true, Ordering::SeqCst);
        result
    });
    written?;

    let elapsed = start.elapsed();
    let stats = vm.stats();
    let dirty = vm.get_dirty_log(0)?;
    println!("elapsed:        {elapsed:.2?}");
    println!("generation:     {}", stats.generation);
    println!("snapshots:      {}", counters.snapshots.load(Ordering::Relaxed));
    println!("translated:     {}", counters.translated.load(Ordering::Relaxed));
    println!("unmapped:       {}", counters.unmapped.load(Ordering::Relaxed));
    println!("guest writes:   {}", counters.writes.load(Ordering::Relaxed));
    println!("evictions:      {}", counters.evictions.load(Ordering::Relaxed));
    println!("retries:        {}", stats.retries);
    println!("fast/slow path: {}/{}", stats.fast_path, stats.slow_path);
    println!("dirty pages:    {}", dirty.dirty_pages().len());
    println!("pins leaked:    {}", vm.pin_ledger().leaked());
    let torn = counters.torn.load(Ordering::Relaxed);
    println!("torn snapshots: {torn}");

    Ok(torn == 0 && vm.pin_ledger().leaked() == 0 && host.outstanding_pins() == 0)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(true) => {}
        Ok(false) => {
            error!("stress run found inconsistencies");
            process::exit(1);
        }
        Err(e) => {
            error!("{e}");
            process::exit(2);
        }
    }
}
