// SIGPORT — NETWORK: SRP ENDPOINT
// Reliable in-order variant (EtherType 0x88B5): stop-and-wait generalized to
// a bounded outstanding-TX window, cumulative ACKs, full-window retransmit
// on timeout.
//
// Cross-engine state, all lock-free:
//   window ring   — sent-but-unacked frame handles; TX pushes the tail on
//                   send, RX pops the head on ACK
//   reclaim ring  — popped frame indices travel home to the TX pool owner
//   ack latch     — RX publishes rx_next_seq; TX emits the ACK frame ahead
//                   of data (the single TX queue stays single-writer)
//   peer latch    — learned MAC, RX → TX

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::payload::{
    payload_pool, Payload, PayloadPool, PayloadReceiver, PayloadReturn, PayloadSender,
};
use crate::engine::runtime::{cpu_pause, tsc_ns, Counters, SetupError, TscCal};
use crate::engine::spsc::{make_spsc, Consumer, Producer};
use crate::engine::wire::{parse_frame, Mac, ETH_P_SRP, OP_SRP_ACK, OP_SRP_DATA};
use crate::network::{
    build_ack_frame, build_data_frame, validate, Config, FrameError, FrameHandle, FramePool,
    NicPort, PeerLatch, RxPath, TxPath, DEFAULT_RETRANSMIT_TIMEOUT_NS,
};

// ============================================================================
// ACK LATCH
// ============================================================================

const ACK_PENDING: u64 = 1 << 32;

/// Cumulative-ACK hand-off RX → TX. Holds at most one pending sequence;
/// a later request overwrites an earlier one, which is exactly what
/// cumulative acknowledgement wants.
pub struct AckLatch(AtomicU64);

impl AckLatch {
    pub fn new() -> Self {
        AckLatch(AtomicU64::new(0))
    }

    /// Schedule a cumulative ACK carrying `seq` (the next expected
    /// sequence: "everything below is received").
    #[inline(always)]
    pub fn request(&self, seq: u32) {
        self.0.store(ACK_PENDING | seq as u64, Ordering::Relaxed);
    }

    /// Claim the pending ACK, if any.
    #[inline(always)]
    pub fn take(&self) -> Option<u32> {
        let v = self.0.swap(0, Ordering::Relaxed);
        if v & ACK_PENDING != 0 {
            Some(v as u32)
        } else {
            None
        }
    }

    /// Put a claimed sequence back without clobbering a newer request.
    #[inline(always)]
    fn restore(&self, seq: u32) {
        let _ = self.0.compare_exchange(
            0,
            ACK_PENDING | seq as u64,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}

impl Default for AckLatch {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// BOOTSTRAP
// ============================================================================

pub struct SrpHandles<P: NicPort> {
    pub tx: SrpTxEngine<P::Tx>,
    pub rx: SrpRxEngine<P::Rx>,
    pub sender: PayloadSender,
    pub receiver: PayloadReceiver,
    pub peer: Arc<PeerLatch>,
    pub counters: Arc<Counters>,
}

/// Build a ready SRP endpoint. On top of the URP skeleton: the window ring
/// sized to the configured window capacity, the reclaim ring sized to twice
/// that (every in-flight index fits), zeroed sequence counters, and the
/// retransmit timer (0 selects the 100 ms default).
pub fn bootstrap<P: NicPort>(cfg: Config, port: P) -> Result<SrpHandles<P>, SetupError> {
    validate(&cfg, true)?;
    let src_mac = port.mac();
    let (tx_path, rx_path) = port.split();

    let ring = cfg.ring_size as usize;
    let window = cfg.window as usize;
    let timeout_ns = if cfg.retransmit_timeout_ns == 0 {
        DEFAULT_RETRANSMIT_TIMEOUT_NS
    } else {
        cfg.retransmit_timeout_ns
    };

    let (out_prod, out_cons) = make_spsc::<Box<Payload>>(ring);
    let (in_prod, in_cons) = make_spsc::<Box<Payload>>(ring);
    let (out_pool, out_ret) = payload_pool(ring + 1);
    let (in_pool, in_ret) = payload_pool(ring + cfg.rx_burst as usize);
    let (win_prod, win_cons) = make_spsc::<FrameHandle>(window);
    let (reclaim_prod, reclaim_cons) = make_spsc::<u32>(2 * window);

    let peer = Arc::new(PeerLatch::new());
    let counters = Arc::new(Counters::new());
    let ack = Arc::new(AckLatch::new());

    Ok(SrpHandles {
        tx: SrpTxEngine {
            tx: tx_path,
            pool: FramePool::new(2 * ring),
            outbound: out_cons,
            recycle: out_ret,
            window: win_prod,
            reclaim: reclaim_cons,
            ack: ack.clone(),
            peer: peer.clone(),
            counters: counters.clone(),
            src_mac,
            default_peer: cfg.default_peer_mac,
            unit_size: cfg.unit_size as usize,
            tx_next_seq: 0,
            timeout_ns,
            timer_ref_ns: 0,
            cal: TscCal::fallback(),
            snapshot: Vec::with_capacity(window),
        },
        rx: SrpRxEngine {
            rx: rx_path,
            pool: FramePool::new(2 * ring),
            inbound: in_prod,
            payloads: in_pool,
            window: win_cons,
            reclaim: reclaim_prod,
            ack,
            peer: peer.clone(),
            counters: counters.clone(),
            handles: vec![FrameHandle { idx: 0, len: 0 }; cfg.rx_burst as usize]
                .into_boxed_slice(),
            staged: Vec::with_capacity(cfg.rx_burst as usize),
            rx_next_seq: 0,
            acked_up_to: 0,
        },
        sender: PayloadSender { ring: out_prod, pool: out_pool },
        receiver: PayloadReceiver { ring: in_cons, ret: in_ret },
        peer,
        counters,
    })
}

fn submit_with_retry<T: TxPath>(tx: &mut T, pool: &FramePool, frames: &[FrameHandle]) {
    let mut sent = 0;
    while sent < frames.len() {
        let accepted = tx.tx_burst(pool, &frames[sent..]);
        sent += accepted;
        if accepted == 0 {
            cpu_pause();
        }
    }
}

// ============================================================================
// TX ENGINE
// ============================================================================

pub struct SrpTxEngine<T: TxPath> {
    tx: T,
    pool: FramePool,
    outbound: Consumer<Box<Payload>>,
    recycle: PayloadReturn,
    window: Producer<FrameHandle>,
    reclaim: Consumer<u32>,
    ack: Arc<AckLatch>,
    peer: Arc<PeerLatch>,
    counters: Arc<Counters>,
    src_mac: Mac,
    default_peer: Mac,
    unit_size: usize,
    tx_next_seq: u32,
    timeout_ns: u64,
    timer_ref_ns: u64,
    cal: TscCal,
    snapshot: Vec<FrameHandle>,
}

impl<T: TxPath> SrpTxEngine<T> {
    /// Swap in a calibrated clock for the retransmit timer.
    pub fn set_clock(&mut self, cal: TscCal) {
        self.cal = cal;
    }

    /// One engine iteration:
    ///   1. take home frame indices released by ACKed window entries
    ///   2. emit the pending cumulative ACK ahead of any data
    ///   3. retransmit the whole window when the timer fires
    ///   4. while the window has room, send one new frame
    /// Returns a work count (0 = fully idle).
    pub fn step(&mut self) -> usize {
        let mut work = 0;

        while let Some(idx) = self.reclaim.pop() {
            self.pool.free(idx);
            work += 1;
        }

        if let Some(ack_seq) = self.ack.take() {
            let dst = self.peer.dst(self.default_peer);
            match build_ack_frame(&mut self.pool, dst, self.src_mac, ack_seq) {
                Ok(h) => {
                    submit_with_retry(&mut self.tx, &self.pool, &[h]);
                    self.pool.free(h.idx);
                    self.counters.acks_tx.value.fetch_add(1, Ordering::Relaxed);
                    work += 1;
                }
                Err(_) => {
                    // Pool dry this instant; retry next iteration unless a
                    // newer cumulative request already superseded this one.
                    self.ack.restore(ack_seq);
                }
            }
        }

        let now = tsc_ns(&self.cal);
        if self.window.len() == 0 {
            self.timer_ref_ns = now;
        } else if now.saturating_sub(self.timer_ref_ns) >= self.timeout_ns {
            // ACKs are cumulative: resend everything outstanding as one
            // burst so any older frames the peer missed arrive together.
            self.window.snapshot_unconsumed(&mut self.snapshot);
            submit_with_retry(&mut self.tx, &self.pool, &self.snapshot);
            self.timer_ref_ns = now;
            self.counters.retransmit_bursts.value.fetch_add(1, Ordering::Relaxed);
            self.counters.tx_frames.value.fetch_add(self.snapshot.len() as u64, Ordering::Relaxed);
            work += self.snapshot.len();
        }

        if self.window.free_slots() > 0 {
            if let Some(p) = self.outbound.pop() {
                let dst = self.peer.dst(self.default_peer);
                loop {
                    match build_data_frame(
                        &mut self.pool,
                        dst,
                        self.src_mac,
                        ETH_P_SRP,
                        self.tx_next_seq,
                        OP_SRP_DATA,
                        p.bytes(),
                        self.unit_size,
                    ) {
                        Ok(h) => {
                            self.tx_next_seq = self.tx_next_seq.wrapping_add(1);
                            submit_with_retry(&mut self.tx, &self.pool, &[h]);
                            // The window owns the frame until an ACK covers
                            // it; free slot was checked above.
                            let _ = self.window.push(h);
                            break;
                        }
                        Err(FrameError::PoolExhausted) => {
                            while let Some(idx) = self.reclaim.pop() {
                                self.pool.free(idx);
                            }
                            cpu_pause();
                        }
                        Err(FrameError::Oversize) => {
                            debug_assert!(false, "oversize payload in outbound ring");
                            break;
                        }
                    }
                }
                self.recycle.give(p);
                self.counters.tx_frames.value.fetch_add(1, Ordering::Relaxed);
                work += 1;
            }
        }

        work
    }

    pub fn run(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            if self.step() == 0 {
                cpu_pause();
            }
        }
    }

    /// Next sequence the engine will assign.
    pub fn next_seq(&self) -> u32 {
        self.tx_next_seq
    }

    /// Current outstanding-window occupancy.
    pub fn window_len(&mut self) -> usize {
        self.window.len()
    }
}

// ============================================================================
// RX ENGINE
// ============================================================================

pub struct SrpRxEngine<R: RxPath> {
    rx: R,
    pool: FramePool,
    inbound: Producer<Box<Payload>>,
    payloads: PayloadPool,
    window: Consumer<FrameHandle>,
    reclaim: Producer<u32>,
    ack: Arc<AckLatch>,
    peer: Arc<PeerLatch>,
    counters: Arc<Counters>,
    handles: Box<[FrameHandle]>,
    staged: Vec<Box<Payload>>,
    rx_next_seq: u32,
    acked_up_to: u32,
}

impl<R: RxPath> SrpRxEngine<R> {
    /// One engine iteration: poll a burst; per frame parse, latch the peer,
    /// then either advance the window head (ACK) or deliver/drop (DATA).
    /// After the burst, schedule one cumulative ACK if anything asked for
    /// it. Returns frames polled (0 = idle).
    pub fn step(&mut self) -> usize {
        let n = self.rx.rx_burst(&mut self.pool, &mut self.handles);
        if n == 0 {
            return 0;
        }
        let mut need_ack = false;
        for i in 0..n {
            let h = self.handles[i];
            {
                let frame = self.pool.frame(h);
                match parse_frame(frame, ETH_P_SRP) {
                    None => {
                        self.counters.rx_malformed.value.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(v) => {
                        self.peer.learn(v.src_mac);
                        match v.opcode {
                            OP_SRP_ACK => {
                                self.counters.acks_rx.value.fetch_add(1, Ordering::Relaxed);
                                // Cumulative: everything below v.seq is
                                // received. Stale or past-the-tail ACKs map
                                // to delta 0 or delta > occupancy — ignored.
                                let delta = v.seq.wrapping_sub(self.acked_up_to) as usize;
                                if delta > 0 && delta <= self.window.len() {
                                    for _ in 0..delta {
                                        let Some(wh) = self.window.pop() else { break };
                                        let mut idx = wh.idx;
                                        while let Err(back) = self.reclaim.push(idx) {
                                            idx = back;
                                            cpu_pause();
                                        }
                                    }
                                    self.acked_up_to = v.seq;
                                }
                            }
                            OP_SRP_DATA => {
                                if v.seq == self.rx_next_seq {
                                    self.rx_next_seq = self.rx_next_seq.wrapping_add(1);
                                    let mut p = loop {
                                        match self.payloads.take() {
                                            Some(p) => break p,
                                            None => cpu_pause(),
                                        }
                                    };
                                    p.set_bytes(v.payload);
                                    self.staged.push(p);
                                    self.counters.rx_frames.value.fetch_add(1, Ordering::Relaxed);
                                } else {
                                    // Out of order: drop, but still ACK so
                                    // the peer resynchronizes.
                                    self.counters
                                        .rx_out_of_order
                                        .value
                                        .fetch_add(1, Ordering::Relaxed);
                                }
                                need_ack = true;
                            }
                            _ => {
                                self.counters.rx_malformed.value.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            }
            self.pool.free(h.idx);
        }

        for p in self.staged.drain(..) {
            let mut item = p;
            loop {
                match self.inbound.stage(item) {
                    Ok(()) => break,
                    Err(back) => {
                        item = back;
                        self.inbound.commit();
                        self.counters.ring_full.value.fetch_add(1, Ordering::Relaxed);
                        cpu_pause();
                    }
                }
            }
        }
        self.inbound.commit();

        if need_ack {
            self.ack.request(self.rx_next_seq);
        }
        n
    }

    pub fn run(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            if self.step() == 0 {
                cpu_pause();
            }
        }
    }

    /// Next in-order sequence expected from the peer.
    pub fn expected_seq(&self) -> u32 {
        self.rx_next_seq
    }

    /// Highest cumulative ACK applied to the local window.
    pub fn acked_up_to(&self) -> u32 {
        self.acked_up_to
    }
}
