// SIGPORT — NETWORK: URP ENDPOINT
// Unreliable variant (EtherType 0x88B6): fire-and-forget DATA frames,
// accept whatever arrives. "Unreliable" is a wire property — the local
// hand-off never drops; the RX engine busy-retries a full inbound ring.
//
// Split-loop data plane:
//   producer → outbound ring → TX engine → NIC
//   NIC → RX engine → inbound ring → consumer
// Spent payload records flow back to their originator over recycle rings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::payload::{
    payload_pool, Payload, PayloadPool, PayloadReceiver, PayloadReturn, PayloadSender,
};
use crate::engine::runtime::{cpu_pause, Counters, SetupError};
use crate::engine::spsc::{make_spsc, Consumer, Producer};
use crate::engine::wire::{parse_frame, Mac, ETH_P_URP, OP_URP_DATA};
use crate::network::{
    build_data_frame, validate, Config, FrameError, FrameHandle, FramePool, NicPort, PeerLatch,
    RxPath, TxPath,
};

/// Everything bootstrap produces: two engines for their pinned threads, the
/// application queue handles, and the shared endpoint state.
pub struct UrpHandles<P: NicPort> {
    pub tx: UrpTxEngine<P::Tx>,
    pub rx: UrpRxEngine<P::Rx>,
    pub sender: PayloadSender,
    pub receiver: PayloadReceiver,
    pub peer: Arc<PeerLatch>,
    pub counters: Arc<Counters>,
}

/// Build a ready URP endpoint: validate the config, size the frame pools at
/// twice the ring capacity, create both payload rings and their record
/// pools, read the source MAC, and split the port between the engines.
/// Everything is RAII — a failure here leaks nothing.
pub fn bootstrap<P: NicPort>(cfg: Config, port: P) -> Result<UrpHandles<P>, SetupError> {
    validate(&cfg, false)?;
    let src_mac = port.mac();
    let (tx_path, rx_path) = port.split();

    let ring = cfg.ring_size as usize;
    let (out_prod, out_cons) = make_spsc::<Box<Payload>>(ring);
    let (in_prod, in_cons) = make_spsc::<Box<Payload>>(ring);
    let (out_pool, out_ret) = payload_pool(ring + cfg.tx_burst as usize);
    let (in_pool, in_ret) = payload_pool(ring + cfg.rx_burst as usize);

    let peer = Arc::new(PeerLatch::new());
    let counters = Arc::new(Counters::new());

    Ok(UrpHandles {
        tx: UrpTxEngine {
            tx: tx_path,
            pool: FramePool::new(2 * ring),
            outbound: out_cons,
            recycle: out_ret,
            peer: peer.clone(),
            counters: counters.clone(),
            src_mac,
            default_peer: cfg.default_peer_mac,
            tx_burst: cfg.tx_burst as usize,
            unit_size: cfg.unit_size as usize,
            tx_seq: 0,
            batch: Vec::with_capacity(cfg.tx_burst as usize),
            frames: Vec::with_capacity(cfg.tx_burst as usize),
        },
        rx: UrpRxEngine {
            rx: rx_path,
            pool: FramePool::new(2 * ring),
            inbound: in_prod,
            payloads: in_pool,
            peer: peer.clone(),
            counters: counters.clone(),
            handles: vec![FrameHandle { idx: 0, len: 0 }; cfg.rx_burst as usize]
                .into_boxed_slice(),
            staged: Vec::with_capacity(cfg.rx_burst as usize),
        },
        sender: PayloadSender { ring: out_prod, pool: out_pool },
        receiver: PayloadReceiver { ring: in_cons, ret: in_ret },
        peer,
        counters,
    })
}

// ============================================================================
// TX ENGINE
// ============================================================================

pub struct UrpTxEngine<T: TxPath> {
    tx: T,
    pool: FramePool,
    outbound: Consumer<Box<Payload>>,
    recycle: PayloadReturn,
    peer: Arc<PeerLatch>,
    counters: Arc<Counters>,
    src_mac: Mac,
    default_peer: Mac,
    tx_burst: usize,
    unit_size: usize,
    tx_seq: u32,
    batch: Vec<Box<Payload>>,
    frames: Vec<FrameHandle>,
}

impl<T: TxPath> UrpTxEngine<T> {
    /// One engine iteration: burst-dequeue, frame, submit, retry the tail
    /// until the NIC drains it. Returns frames sent (0 = idle).
    pub fn step(&mut self) -> usize {
        let n = self.outbound.pop_batch(&mut self.batch, self.tx_burst);
        if n == 0 {
            return 0;
        }
        let dst = self.peer.dst(self.default_peer);
        self.frames.clear();
        for p in self.batch.drain(..) {
            loop {
                match build_data_frame(
                    &mut self.pool,
                    dst,
                    self.src_mac,
                    ETH_P_URP,
                    self.tx_seq,
                    OP_URP_DATA,
                    p.bytes(),
                    self.unit_size,
                ) {
                    Ok(h) => {
                        self.tx_seq = self.tx_seq.wrapping_add(1);
                        self.frames.push(h);
                        break;
                    }
                    // Frames free at the end of this step, so the burst
                    // bounds the spin.
                    Err(FrameError::PoolExhausted) => cpu_pause(),
                    Err(FrameError::Oversize) => {
                        // submit() rejects oversize records before they
                        // reach the ring.
                        debug_assert!(false, "oversize payload in outbound ring");
                        break;
                    }
                }
            }
            // The producer owns the record pool; return, never free.
            self.recycle.give(p);
        }

        let mut sent = 0;
        while sent < self.frames.len() {
            let accepted = self.tx.tx_burst(&self.pool, &self.frames[sent..]);
            sent += accepted;
            if accepted == 0 {
                cpu_pause();
            }
        }
        for h in &self.frames {
            self.pool.free(h.idx);
        }
        self.counters.tx_frames.value.fetch_add(sent as u64, Ordering::Relaxed);
        sent
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
        self.tx_seq
    }
}

// ============================================================================
// RX ENGINE
// ============================================================================

pub struct UrpRxEngine<R: RxPath> {
    rx: R,
    pool: FramePool,
    inbound: Producer<Box<Payload>>,
    payloads: PayloadPool,
    peer: Arc<PeerLatch>,
    counters: Arc<Counters>,
    handles: Box<[FrameHandle]>,
    staged: Vec<Box<Payload>>,
}

impl<R: RxPath> UrpRxEngine<R> {
    /// One engine iteration: poll, parse, latch the peer, copy into fresh
    /// records, free the NIC buffers, enqueue inbound with tail retry.
    /// Returns frames polled (0 = idle).
    pub fn step(&mut self) -> usize {
        let n = self.rx.rx_burst(&mut self.pool, &mut self.handles);
        if n == 0 {
            return 0;
        }
        for i in 0..n {
            let h = self.handles[i];
            {
                let frame = self.pool.frame(h);
                match parse_frame(frame, ETH_P_URP) {
                    Some(v) if v.opcode == OP_URP_DATA => {
                        self.peer.learn(v.src_mac);
                        let mut p = loop {
                            // Spins only while the consumer sits on every
                            // record — the designed backpressure.
                            match self.payloads.take() {
                                Some(p) => break p,
                                None => cpu_pause(),
                            }
                        };
                        p.set_bytes(v.payload);
                        self.staged.push(p);
                        self.counters.rx_frames.value.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        self.counters.rx_malformed.value.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            self.pool.free(h.idx);
        }

        // Local hand-off backpressure point: retry the tail, never drop.
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
        n
    }

    pub fn run(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            if self.step() == 0 {
                cpu_pause();
            }
        }
    }
}
