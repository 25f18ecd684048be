// SIGPORT — ENGINE: RUNTIME MODULE
// Infrastructure that supports the engines but isn't the protocol itself:
// fatal exit diagnostics, bootstrap errors, slab allocator, TSC fast clock,
// CPU pinning, pause hint, and the shared counter block.

use std::sync::atomic::AtomicU64;
use std::time::Duration;

// ============================================================================
// FATAL EXIT + DIAGNOSTIC ERROR CODES
// ============================================================================

// Convention: 0x10-0x1F = Boot, 0x20-0x2F = Runtime

pub const E_BAD_ARGS: i32 = 0x10;
pub const E_RING_SIZE: i32 = 0x11;
pub const E_UNIT_SIZE: i32 = 0x12;
pub const E_BURST_SIZE: i32 = 0x13;
pub const E_WINDOW_SIZE: i32 = 0x14;
pub const E_PORT_INIT: i32 = 0x15;
pub const E_NO_BACKEND: i32 = 0x16;
pub const E_THREAD_SPAWN: i32 = 0x20;

/// Structured fatal exit for the binaries. No heap allocation, no unwinding.
/// Writes "[SIG FATAL 0xHH] msg\n" to stderr in a single writev syscall so
/// concurrent fatals never interleave, then exits with the code.
#[inline(never)]
pub fn fatal(code: i32, msg: &str) -> ! {
    let prefix = b"[SIG FATAL 0x";
    let hex = [
        b"0123456789ABCDEF"[((code >> 4) & 0xF) as usize],
        b"0123456789ABCDEF"[(code & 0xF) as usize],
    ];
    let suffix = b"] ";
    let newline = b"\n";
    let iov = [
        libc::iovec { iov_base: prefix.as_ptr() as *mut _, iov_len: prefix.len() },
        libc::iovec { iov_base: hex.as_ptr() as *mut _, iov_len: 2 },
        libc::iovec { iov_base: suffix.as_ptr() as *mut _, iov_len: suffix.len() },
        libc::iovec { iov_base: msg.as_ptr() as *mut _, iov_len: msg.len() },
        libc::iovec { iov_base: newline.as_ptr() as *mut _, iov_len: 1 },
    ];
    // SAFETY: fd 2 is always open; every iovec points at a live buffer with
    // its exact length.
    unsafe { libc::writev(2, iov.as_ptr(), 5) };
    std::process::exit(code);
}

/// Bootstrap failure. The library returns these; the binaries map them onto
/// `fatal` with the matching diagnostic code.
#[derive(Debug)]
pub enum SetupError {
    /// Ring capacity must be a power of two and at least 2.
    RingSize(u32),
    /// SRP window capacity must be a power of two, at least 2, and no larger
    /// than the ring.
    WindowSize(u16),
    /// Unit size below the 24-byte framing minimum or above a frame slot.
    UnitSize(u16),
    /// Burst size of zero, or larger than the ring capacity.
    BurstSize(u16),
    /// NIC port bring-up failed.
    Port(String),
}

impl SetupError {
    pub fn code(&self) -> i32 {
        match self {
            SetupError::RingSize(_) => E_RING_SIZE,
            SetupError::WindowSize(_) => E_WINDOW_SIZE,
            SetupError::UnitSize(_) => E_UNIT_SIZE,
            SetupError::BurstSize(_) => E_BURST_SIZE,
            SetupError::Port(_) => E_PORT_INIT,
        }
    }
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::RingSize(n) => {
                write!(f, "ring size {} invalid: must be a power of two >= 2", n)
            }
            SetupError::WindowSize(n) => {
                write!(f, "window size {} invalid: must be a power of two >= 2 and <= ring size", n)
            }
            SetupError::UnitSize(n) => {
                write!(f, "unit size {} invalid: below 24-byte frame header or above frame slot", n)
            }
            SetupError::BurstSize(n) => {
                write!(f, "burst size {} invalid: must be >= 1 and <= ring size", n)
            }
            SetupError::Port(msg) => write!(f, "port init failed: {}", msg),
        }
    }
}

impl std::error::Error for SetupError {}

// ============================================================================
// CACHE-LINE PADDING
// ============================================================================

/// 128 bytes covers both the adjacent-line hardware prefetcher pair on
/// x86_64 and the 128-byte stride on large ARM cores.
#[repr(C, align(128))]
pub struct CachePadded<T> {
    pub value: T,
}

// ============================================================================
// SLAB ALLOCATOR
// ============================================================================

/// Fixed-size LIFO index allocator. O(1) alloc/free, no branching beyond the
/// emptiness check. Manages frame indices for the packet-buffer pools.
#[repr(align(64))]
pub struct FixedSlab {
    stack: Box<[u32]>,
    top: usize,
    capacity: usize,
}

impl FixedSlab {
    pub fn new(capacity: usize) -> Self {
        let mut vec = Vec::with_capacity(capacity);
        for i in 0..capacity {
            vec.push(i as u32);
        }
        FixedSlab { stack: vec.into_boxed_slice(), top: capacity, capacity }
    }

    #[inline(always)]
    pub fn alloc(&mut self) -> Option<u32> {
        if self.top == 0 {
            return None;
        }
        self.top -= 1;
        // SAFETY: top was > 0, so it now indexes into the stack.
        unsafe { Some(*self.stack.get_unchecked(self.top)) }
    }

    #[inline(always)]
    pub fn free(&mut self, idx: u32) {
        if self.top < self.capacity {
            // SAFETY: top < capacity guarantees a valid slot.
            unsafe { *self.stack.get_unchecked_mut(self.top) = idx };
            self.top += 1;
        }
    }

    #[inline(always)]
    pub fn available(&self) -> usize {
        self.top
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// PAUSE HINT
// ============================================================================

/// Architectural pause for idle busy-poll iterations: the only form of
/// "suspension" the data plane ever performs.
#[inline(always)]
pub fn cpu_pause() {
    std::hint::spin_loop();
}

// ============================================================================
// TSC FAST CLOCK
// Raw rdtsc / CNTVCT_EL0 with boot-time two-point calibration against
// CLOCK_MONOTONIC. Fixed-point multiply+shift conversion; clock_gettime
// fallback when calibration is unavailable or inaccurate.
// ============================================================================

#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: FFI call with a valid mutable timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// TSC-to-nanosecond calibration. Computed once at boot, immutable after.
/// Conversion: ns = mono_base + ((tsc - tsc_base) * mult) >> shift.
#[derive(Clone, Copy)]
pub struct TscCal {
    tsc_base: u64,
    mono_base: u64,
    mult: u32,
    shift: u32,
    valid: bool,
}

impl TscCal {
    /// Fallback calibration: `tsc_ns` reads `clock_ns` instead.
    pub fn fallback() -> Self {
        TscCal { tsc_base: 0, mono_base: 0, mult: 0, shift: 0, valid: false }
    }
}

impl Default for TscCal {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Raw counter read. Unserialized; out-of-order error is a couple of
/// nanoseconds, irrelevant against a 100 ms retransmit timer.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_tsc() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: rdtsc only writes the named registers.
    unsafe {
        core::arch::asm!("rdtsc", out("eax") lo, out("edx") hi,
            options(nostack, nomem, preserves_flags));
    }
    ((hi as u64) << 32) | (lo as u64)
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn read_tsc() -> u64 {
    let cnt: u64;
    // SAFETY: CNTVCT_EL0 is an unprivileged read-only register.
    unsafe {
        core::arch::asm!("mrs {cnt}, CNTVCT_EL0", cnt = out(reg) cnt,
            options(nostack, nomem, preserves_flags));
    }
    cnt
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn read_tsc() -> u64 {
    clock_ns()
}

/// Convert a raw counter value to nanoseconds. Hot path: subtract, u128
/// multiply, shift, add.
#[inline(always)]
pub fn tsc_ns(cal: &TscCal) -> u64 {
    if !cal.valid {
        return clock_ns();
    }
    let delta = read_tsc().wrapping_sub(cal.tsc_base);
    cal.mono_base.wrapping_add(((delta as u128 * cal.mult as u128) >> cal.shift) as u64)
}

/// Two-point calibration over 100 ms, validated over 1000 samples.
/// Returns the fallback when the counter is unusable.
pub fn calibrate_tsc() -> TscCal {
    for _ in 0..100 {
        let _ = read_tsc();
        let _ = clock_ns();
    }

    let tsc0 = read_tsc();
    let mono0 = clock_ns();
    std::thread::sleep(Duration::from_millis(100));
    let tsc1 = read_tsc();
    let mono1 = clock_ns();

    let tsc_delta = tsc1.wrapping_sub(tsc0);
    let mono_delta = mono1.saturating_sub(mono0);
    if tsc_delta == 0 || mono_delta == 0 {
        eprintln!("[SIG-TSC] WARNING: calibration got a zero delta, using clock_gettime");
        return TscCal::fallback();
    }

    let shift: u32 = 32;
    let mult = ((mono_delta as u128) << shift) / (tsc_delta as u128);
    if mult > u32::MAX as u128 {
        eprintln!("[SIG-TSC] WARNING: counter too slow for u32 mult, using clock_gettime");
        return TscCal::fallback();
    }

    let cal = TscCal {
        tsc_base: read_tsc(),
        mono_base: clock_ns(),
        mult: mult as u32,
        shift,
        valid: true,
    };

    let mut max_error: i64 = 0;
    for _ in 0..1000 {
        let err = (tsc_ns(&cal) as i64 - clock_ns() as i64).abs();
        if err > max_error {
            max_error = err;
        }
    }
    let freq_khz = (tsc_delta as u128 * 1_000_000) / (mono_delta as u128);
    eprintln!(
        "[SIG-TSC] calibrated: freq={}.{:03}MHz mult={} shift={} max_err={}ns",
        freq_khz / 1000,
        freq_khz % 1000,
        mult,
        shift,
        max_error
    );
    if max_error > 1000 {
        eprintln!("[SIG-TSC] WARNING: calibration error > 1us, using clock_gettime");
        return TscCal::fallback();
    }
    cal
}

// ============================================================================
// CPU MANAGEMENT
// ============================================================================

/// Pin the calling thread to one core. Returns false when the kernel
/// rejects the affinity (the caller decides whether that is fatal).
pub fn pin_to_core(core_id: usize) -> bool {
    // SAFETY: cpu_set_t is repr(C) and all-zeroes is a valid bit pattern.
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) == 0
    }
}

/// Cores the kernel keeps off the scheduler (isolcpus), best candidates for
/// the engine threads.
pub fn discover_isolated_cores() -> Vec<usize> {
    match std::fs::read_to_string("/sys/devices/system/cpu/isolated") {
        Ok(s) => parse_cpu_list(s.trim()),
        Err(_) => Vec::new(),
    }
}

pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cores = Vec::new();
    if list.is_empty() {
        return cores;
    }
    for part in list.split(',') {
        if let Some((a, b)) = part.split_once('-') {
            if let (Ok(s), Ok(e)) = (a.parse::<usize>(), b.parse::<usize>()) {
                for i in s..=e {
                    cores.push(i);
                }
            }
        } else if let Ok(id) = part.parse::<usize>() {
            cores.push(id);
        }
    }
    cores.sort_unstable();
    cores.dedup();
    cores
}

// ============================================================================
// COUNTERS — per-endpoint relaxed atomics, shared across engine threads
// ============================================================================

pub struct Counters {
    pub tx_frames: CachePadded<AtomicU64>,
    pub rx_frames: CachePadded<AtomicU64>,
    pub rx_malformed: CachePadded<AtomicU64>,
    pub rx_out_of_order: CachePadded<AtomicU64>,
    pub acks_tx: CachePadded<AtomicU64>,
    pub acks_rx: CachePadded<AtomicU64>,
    pub retransmit_bursts: CachePadded<AtomicU64>,
    pub ring_full: CachePadded<AtomicU64>,
}

impl Counters {
    pub fn new() -> Self {
        Counters {
            tx_frames: CachePadded { value: AtomicU64::new(0) },
            rx_frames: CachePadded { value: AtomicU64::new(0) },
            rx_malformed: CachePadded { value: AtomicU64::new(0) },
            rx_out_of_order: CachePadded { value: AtomicU64::new(0) },
            acks_tx: CachePadded { value: AtomicU64::new(0) },
            acks_rx: CachePadded { value: AtomicU64::new(0) },
            retransmit_bursts: CachePadded { value: AtomicU64::new(0) },
            ring_full: CachePadded { value: AtomicU64::new(0) },
        }
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
