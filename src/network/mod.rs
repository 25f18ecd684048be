// SIGPORT — NETWORK MODULE
// Module map:
//   mod.rs — FramePool + FrameHandle, frame builders, the NIC port contract
//            (TxPath / RxPath / NicPort), PeerLatch, endpoint Config
//   sim.rs — in-process loopback link with fault injection
//   xdp.rs — AF_XDP backend (feature "xdp")
//   urp.rs — unreliable endpoint (EtherType 0x88B6)
//   srp.rs — reliable endpoint (EtherType 0x88B5)

pub mod sim;
pub mod srp;
pub mod urp;
#[cfg(feature = "xdp")]
pub mod xdp;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::runtime::{FixedSlab, SetupError};
use crate::engine::wire::{
    build_frame, Mac, ETH_P_SRP, FRAME_HDR_SIZE, MAX_PAYLOAD, OP_SRP_ACK,
};

// ============================================================================
// FRAME POOL
// ============================================================================

/// Bytes per frame slot. One MTU frame plus headroom; the largest frame this
/// protocol emits is 24 + 1024 bytes.
pub const FRAME_CAPACITY: usize = 2048;

const _: () = assert!(FRAME_CAPACITY >= FRAME_HDR_SIZE + MAX_PAYLOAD);

/// Descriptor for a frame living in a pool: slot index + live length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHandle {
    pub idx: u32,
    pub len: u32,
}

/// Packet-buffer pool: a contiguous frame arena plus a LIFO index slab.
/// Each engine direction owns its own pool; indices may travel to the other
/// engine (SRP window) but always come home before being freed.
pub struct FramePool {
    mem: Box<[u8]>,
    slab: FixedSlab,
}

impl FramePool {
    pub fn new(frames: usize) -> Self {
        FramePool {
            mem: vec![0u8; frames * FRAME_CAPACITY].into_boxed_slice(),
            slab: FixedSlab::new(frames),
        }
    }

    #[inline(always)]
    pub fn alloc(&mut self) -> Option<u32> {
        self.slab.alloc()
    }

    #[inline(always)]
    pub fn free(&mut self, idx: u32) {
        self.slab.free(idx);
    }

    #[inline(always)]
    pub fn available(&self) -> usize {
        self.slab.available()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    /// Full slot for writing a frame into.
    #[inline(always)]
    pub fn slot_mut(&mut self, idx: u32) -> &mut [u8] {
        let start = idx as usize * FRAME_CAPACITY;
        &mut self.mem[start..start + FRAME_CAPACITY]
    }

    /// Live bytes of a built or received frame.
    #[inline(always)]
    pub fn frame(&self, h: FrameHandle) -> &[u8] {
        let start = h.idx as usize * FRAME_CAPACITY;
        &self.mem[start..start + h.len as usize]
    }
}

// ============================================================================
// FRAME BUILDERS
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Payload exceeds MAX_PAYLOAD. Rejected before a buffer is drawn.
    Oversize,
    /// Pool has no free frame right now.
    PoolExhausted,
}

/// Draw a frame from `pool` and serialize a data frame into it.
#[inline]
#[allow(clippy::too_many_arguments)]
pub fn build_data_frame(
    pool: &mut FramePool,
    dst: Mac,
    src: Mac,
    ethertype: u16,
    seq: u32,
    opcode: u16,
    payload: &[u8],
    unit_size: usize,
) -> Result<FrameHandle, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::Oversize);
    }
    let idx = pool.alloc().ok_or(FrameError::PoolExhausted)?;
    let len = build_frame(pool.slot_mut(idx), dst, src, ethertype, seq, opcode, payload, unit_size);
    Ok(FrameHandle { idx, len: len as u32 })
}

/// Cumulative SRP ACK: header only, never padded (the 24-byte minimum frame).
#[inline]
pub fn build_ack_frame(
    pool: &mut FramePool,
    dst: Mac,
    src: Mac,
    seq: u32,
) -> Result<FrameHandle, FrameError> {
    build_data_frame(pool, dst, src, ETH_P_SRP, seq, OP_SRP_ACK, &[], FRAME_HDR_SIZE)
}

// ============================================================================
// NIC PORT CONTRACT
// ============================================================================
// The kernel-bypass runtime behind these traits is an external collaborator:
// it supplies poll-mode burst I/O against the pools defined above. Frame
// bytes are copied out of / into the pool inside the call, so ownership of
// accepted frames stays with the caller — URP frees them right after the
// burst, SRP parks them in the outstanding window for retransmission.

pub trait TxPath: Send {
    /// Submit a burst. Returns how many frames (a prefix of `frames`) the
    /// queue accepted; fewer than `frames.len()` means the NIC is saturated
    /// and the caller retries the tail.
    fn tx_burst(&mut self, pool: &FramePool, frames: &[FrameHandle]) -> usize;
}

pub trait RxPath: Send {
    /// Poll a burst. Each received frame is copied into a freshly drawn
    /// `pool` frame; returns how many entries of `out` were filled. Stops
    /// early when the pool runs dry.
    fn rx_burst(&mut self, pool: &mut FramePool, out: &mut [FrameHandle]) -> usize;
}

/// One physical (or simulated) port with a single TX/RX queue pair.
pub trait NicPort {
    type Tx: TxPath;
    type Rx: RxPath;

    /// Hardware source MAC, read at bootstrap.
    fn mac(&self) -> Mac;

    /// Hand the queue halves to the two engines.
    fn split(self) -> (Self::Tx, Self::Rx);
}

// ============================================================================
// LEARNED-PEER LATCH
// ============================================================================

const LEARNED: u64 = 1 << 48;

/// Learned-peer MAC shared RX → TX. The 48-bit address and the learned flag
/// live in one AtomicU64, so the latch is monotone and reads are never torn.
pub struct PeerLatch(AtomicU64);

impl PeerLatch {
    pub fn new() -> Self {
        PeerLatch(AtomicU64::new(0))
    }

    /// Latch the peer observed on a valid inbound frame. May update the
    /// address later; the learned flag never reverts.
    #[inline(always)]
    pub fn learn(&self, mac: Mac) {
        self.0.store(mac.to_u64() | LEARNED, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_learned(&self) -> bool {
        self.0.load(Ordering::Relaxed) & LEARNED != 0
    }

    #[inline(always)]
    pub fn get(&self) -> Option<Mac> {
        let v = self.0.load(Ordering::Relaxed);
        if v & LEARNED != 0 {
            Some(Mac::from_u64(v))
        } else {
            None
        }
    }

    /// Destination for outbound frames: learned peer, else the configured
    /// fallback.
    #[inline(always)]
    pub fn dst(&self, fallback: Mac) -> Mac {
        self.get().unwrap_or(fallback)
    }
}

impl Default for PeerLatch {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ENDPOINT CONFIG
// ============================================================================

pub const DEFAULT_RING_SIZE: u32 = 4096;
pub const DEFAULT_BURST: u16 = 128;
pub const DEFAULT_UNIT_SIZE: u16 = 64;
pub const DEFAULT_WINDOW: u16 = 64;
/// Retransmit timer default: timer-hz / 10.
pub const DEFAULT_RETRANSMIT_TIMEOUT_NS: u64 = 100_000_000;

#[derive(Clone, Debug)]
pub struct Config {
    pub port_id: u16,
    /// Destination until a peer is learned (broadcast for a cold start).
    pub default_peer_mac: Mac,
    /// Capacity of each payload ring. Power of two, >= 2.
    pub ring_size: u32,
    /// Max frames per TX submit.
    pub tx_burst: u16,
    /// Max frames per RX poll.
    pub rx_burst: u16,
    /// Pad every data frame to this total length. >= 24.
    pub unit_size: u16,
    /// SRP outstanding-TX window capacity. Power of two, >= 2.
    pub window: u16,
    /// SRP retransmit timeout; 0 selects the 100 ms default.
    pub retransmit_timeout_ns: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port_id: 0,
            default_peer_mac: Mac::BROADCAST,
            ring_size: DEFAULT_RING_SIZE,
            tx_burst: DEFAULT_BURST,
            rx_burst: DEFAULT_BURST,
            unit_size: DEFAULT_UNIT_SIZE,
            window: DEFAULT_WINDOW,
            retransmit_timeout_ns: 0,
        }
    }
}

pub(crate) fn validate(cfg: &Config, srp: bool) -> Result<(), SetupError> {
    if !cfg.ring_size.is_power_of_two() || cfg.ring_size < 2 {
        return Err(SetupError::RingSize(cfg.ring_size));
    }
    if (cfg.unit_size as usize) < FRAME_HDR_SIZE || cfg.unit_size as usize > FRAME_CAPACITY {
        return Err(SetupError::UnitSize(cfg.unit_size));
    }
    if cfg.tx_burst == 0 || cfg.tx_burst as u32 > cfg.ring_size {
        return Err(SetupError::BurstSize(cfg.tx_burst));
    }
    if cfg.rx_burst == 0 || cfg.rx_burst as u32 > cfg.ring_size {
        return Err(SetupError::BurstSize(cfg.rx_burst));
    }
    if srp && (!cfg.window.is_power_of_two() || cfg.window < 2 || cfg.window as u32 > cfg.ring_size)
    {
        return Err(SetupError::WindowSize(cfg.window));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::wire::{parse_frame, ETH_P_URP, OP_URP_DATA};

    const SRC: Mac = Mac([0x02, 0, 0, 0, 0, 0x01]);
    const DST: Mac = Mac([0x02, 0, 0, 0, 0, 0x02]);

    #[test]
    fn pool_frames_round_trip() {
        let mut pool = FramePool::new(4);
        let h = build_data_frame(&mut pool, DST, SRC, ETH_P_URP, 9, OP_URP_DATA, &[1, 2, 3], 64)
            .unwrap();
        let v = parse_frame(pool.frame(h), ETH_P_URP).unwrap();
        assert_eq!(v.seq, 9);
        assert_eq!(v.payload, &[1, 2, 3]);
        pool.free(h.idx);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn oversize_build_draws_no_buffer() {
        let mut pool = FramePool::new(4);
        let before = pool.available();
        let big = [0u8; MAX_PAYLOAD + 1];
        let err = build_data_frame(&mut pool, DST, SRC, ETH_P_URP, 0, OP_URP_DATA, &big, 64);
        assert_eq!(err, Err(FrameError::Oversize));
        assert_eq!(pool.available(), before);
    }

    #[test]
    fn exhausted_pool_reports_it() {
        let mut pool = FramePool::new(1);
        let h = build_data_frame(&mut pool, DST, SRC, ETH_P_URP, 0, OP_URP_DATA, &[], 64).unwrap();
        let err = build_data_frame(&mut pool, DST, SRC, ETH_P_URP, 1, OP_URP_DATA, &[], 64);
        assert_eq!(err, Err(FrameError::PoolExhausted));
        pool.free(h.idx);
        assert!(build_data_frame(&mut pool, DST, SRC, ETH_P_URP, 2, OP_URP_DATA, &[], 64).is_ok());
    }

    #[test]
    fn ack_frames_are_minimum_size() {
        let mut pool = FramePool::new(1);
        let h = build_ack_frame(&mut pool, DST, SRC, 77).unwrap();
        assert_eq!(h.len as usize, FRAME_HDR_SIZE);
    }

    #[test]
    fn peer_latch_is_monotone() {
        let latch = PeerLatch::new();
        assert!(!latch.is_learned());
        assert_eq!(latch.dst(Mac::BROADCAST), Mac::BROADCAST);
        latch.learn(SRC);
        assert!(latch.is_learned());
        assert_eq!(latch.dst(Mac::BROADCAST), SRC);
        latch.learn(DST);
        assert!(latch.is_learned());
        assert_eq!(latch.get(), Some(DST));
    }

    #[test]
    fn config_validation() {
        let ok = Config::default();
        assert!(validate(&ok, true).is_ok());

        let mut bad = Config::default();
        bad.ring_size = 1;
        assert!(matches!(validate(&bad, false), Err(SetupError::RingSize(1))));
        bad.ring_size = 100;
        assert!(validate(&bad, false).is_err());

        let mut bad = Config::default();
        bad.unit_size = 23;
        assert!(matches!(validate(&bad, false), Err(SetupError::UnitSize(23))));

        let mut bad = Config::default();
        bad.tx_burst = 0;
        assert!(matches!(validate(&bad, false), Err(SetupError::BurstSize(0))));

        let mut bad = Config::default();
        bad.window = 48;
        assert!(validate(&bad, false).is_ok()); // URP ignores the window
        assert!(matches!(validate(&bad, true), Err(SetupError::WindowSize(48))));

        let mut tight = Config::default();
        tight.ring_size = 2;
        tight.tx_burst = 2;
        tight.rx_burst = 1;
        tight.window = 2;
        assert!(validate(&tight, true).is_ok());
    }
}
