// SIGPORT — NETWORK: XDP PORT (feature "xdp")
// AF_XDP backend for real interfaces. Owns the UMEM, the XSK socket, and
// the four kernel rings; bridges them to the crate's FramePool contract in
// copy mode (one copy per direction, frame ownership stays with the
// engines, which is what the SRP window needs).
//
// UMEM frames are split down the middle: the low half feeds TX, the high
// half cycles through the fill ring for RX.

use std::ffi::CString;
use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use libbpf_sys::{
    xdp_desc, xsk_ring_cons, xsk_ring_prod, xsk_socket__create, xsk_socket__delete,
    xsk_socket__fd, xsk_socket_config, xsk_umem__create, xsk_umem__delete, xsk_umem_config,
};
use libc::{
    mmap, munmap, sendto, MAP_ANONYMOUS, MAP_FAILED, MAP_POPULATE, MAP_PRIVATE, MSG_DONTWAIT,
    PROT_READ, PROT_WRITE,
};

use crate::engine::runtime::{FixedSlab, SetupError};
use crate::engine::wire::Mac;
use crate::network::{FrameHandle, FramePool, NicPort, RxPath, TxPath, FRAME_CAPACITY};

pub const UMEM_FRAMES: usize = 4096;
pub const UMEM_FRAME_SIZE: usize = FRAME_CAPACITY; // AF_XDP chunk size, power of two
pub const UMEM_SIZE: usize = UMEM_FRAMES * UMEM_FRAME_SIZE;
const KERNEL_RING_DEPTH: u32 = 2048;

pub const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

// ============================================================================
// KERNEL RING WRAPPERS (lock-free SPSC with explicit memory barriers)
// ============================================================================

struct RingProd {
    producer: *mut u32,
    consumer: *mut u32,
    ring: *mut libc::c_void,
    mask: u32,
    local_prod: u32,
    cached_cons: u32,
}

struct RingCons {
    producer: *mut u32,
    consumer: *mut u32,
    ring: *mut libc::c_void,
    mask: u32,
}

impl RingProd {
    // SAFETY preconditions for all methods: the xsk ring this wraps outlives
    // the wrapper (the Umem Arc guarantees it), and exactly one thread
    // drives each wrapper.
    unsafe fn new(r: *const xsk_ring_prod) -> Self {
        let init = (*((*r).producer as *mut AtomicU32)).load(Ordering::Relaxed);
        RingProd {
            producer: (*r).producer,
            consumer: (*r).consumer,
            ring: (*r).ring,
            mask: (*r).mask,
            local_prod: init,
            cached_cons: 0,
        }
    }

    #[inline(always)]
    unsafe fn available(&mut self) -> u32 {
        self.cached_cons = (*(self.consumer as *mut AtomicU32)).load(Ordering::Acquire);
        (self.mask + 1).saturating_sub(self.local_prod.wrapping_sub(self.cached_cons))
    }

    #[inline(always)]
    unsafe fn stage_addr(&mut self, addr: u64) {
        let slot = (self.ring as *mut u64).offset((self.local_prod & self.mask) as isize);
        *slot = addr;
        self.local_prod = self.local_prod.wrapping_add(1);
    }

    #[inline(always)]
    unsafe fn stage_desc(&mut self, addr: u64, len: u32) {
        let desc = (self.ring as *mut xdp_desc).offset((self.local_prod & self.mask) as isize);
        (*desc).addr = addr;
        (*desc).len = len;
        (*desc).options = 0;
        self.local_prod = self.local_prod.wrapping_add(1);
    }

    #[inline(always)]
    unsafe fn commit(&mut self) {
        fence(Ordering::Release);
        (*(self.producer as *mut AtomicU32)).store(self.local_prod, Ordering::Relaxed);
    }
}

impl RingCons {
    unsafe fn new(r: *const xsk_ring_cons) -> Self {
        RingCons {
            producer: (*r).producer,
            consumer: (*r).consumer,
            ring: (*r).ring,
            mask: (*r).mask,
        }
    }

    /// Drain completed TX addresses back into the frame slab.
    #[inline(always)]
    unsafe fn consume_addrs(&mut self, slab: &mut FixedSlab) -> usize {
        let cons_ptr = self.consumer as *mut AtomicU32;
        let cons_val = (*cons_ptr).load(Ordering::Relaxed);
        let prod_val = (*(self.producer as *mut AtomicU32)).load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        let available = prod_val.wrapping_sub(cons_val);
        if available == 0 {
            return 0;
        }
        let addrs = self.ring as *const u64;
        for i in 0..available {
            let addr = *addrs.offset((cons_val.wrapping_add(i) & self.mask) as isize);
            slab.free((addr / UMEM_FRAME_SIZE as u64) as u32);
        }
        (*cons_ptr).store(cons_val.wrapping_add(available), Ordering::Release);
        available as usize
    }

    #[inline(always)]
    unsafe fn consume_descs(&mut self, out: &mut [xdp_desc]) -> usize {
        let cons_ptr = self.consumer as *mut AtomicU32;
        let cons_val = (*cons_ptr).load(Ordering::Relaxed);
        let prod_val = (*(self.producer as *mut AtomicU32)).load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        let count = (prod_val.wrapping_sub(cons_val) as usize).min(out.len());
        if count == 0 {
            return 0;
        }
        let descs = self.ring as *const xdp_desc;
        for (i, slot) in out.iter_mut().enumerate().take(count) {
            *slot = *descs.add((cons_val.wrapping_add(i as u32) & self.mask) as usize);
        }
        (*cons_ptr).store(cons_val.wrapping_add(count as u32), Ordering::Release);
        count
    }
}

// ============================================================================
// UMEM (shared by both halves, torn down with the last one)
// ============================================================================

struct Umem {
    area: *mut u8,
    umem_handle: *mut libbpf_sys::xsk_umem,
    sock_handle: *mut libbpf_sys::xsk_socket,
}

// SAFETY: the raw handles are only used for teardown; frame memory access
// is partitioned between the TX half (low indices) and RX half (high).
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

impl Drop for Umem {
    fn drop(&mut self) {
        // SAFETY: created in XdpPort::open and never freed elsewhere.
        unsafe {
            xsk_socket__delete(self.sock_handle);
            xsk_umem__delete(self.umem_handle);
            munmap(self.area as *mut libc::c_void, UMEM_SIZE);
        }
    }
}

/// Hardware MAC from sysfs.
fn detect_mac(if_name: &str) -> Result<Mac, SetupError> {
    let path = format!("/sys/class/net/{}/address", if_name);
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| SetupError::Port(format!("read {}: {}", path, e)))?;
    contents
        .trim()
        .parse::<Mac>()
        .map_err(|e| SetupError::Port(format!("parse {}: {}", path, e)))
}

pub struct XdpPort {
    mac: Mac,
    tx: XdpTx,
    rx: XdpRx,
}

impl XdpPort {
    /// Bring up AF_XDP on one interface queue: UMEM, XSK socket, fill ring
    /// primed with the RX half of the frames. Hugepages, device binding and
    /// queue layout are the host's responsibility.
    pub fn open(if_name: &str, queue_id: u32) -> Result<XdpPort, SetupError> {
        let mac = detect_mac(if_name)?;

        // SAFETY: standard anonymous mapping; checked against MAP_FAILED.
        let area = unsafe {
            mmap(
                ptr::null_mut(),
                UMEM_SIZE,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if area == MAP_FAILED {
            return Err(SetupError::Port("UMEM mmap failed".into()));
        }

        let umem_cfg = xsk_umem_config {
            fill_size: KERNEL_RING_DEPTH,
            comp_size: KERNEL_RING_DEPTH,
            frame_size: UMEM_FRAME_SIZE as u32,
            frame_headroom: 0,
            flags: 0,
        };
        let mut umem_handle: *mut libbpf_sys::xsk_umem = ptr::null_mut();
        // SAFETY: zeroed ring structs are the documented initialization; the
        // create calls fill them in.
        unsafe {
            let mut fq_def: xsk_ring_prod = mem::zeroed();
            let mut cq_def: xsk_ring_cons = mem::zeroed();
            let ret = xsk_umem__create(
                &mut umem_handle,
                area,
                UMEM_SIZE as u64,
                &mut fq_def,
                &mut cq_def,
                &umem_cfg,
            );
            if ret != 0 {
                munmap(area, UMEM_SIZE);
                return Err(SetupError::Port(format!("xsk_umem__create: {}", ret)));
            }

            let mut sock_cfg: xsk_socket_config = mem::zeroed();
            sock_cfg.rx_size = KERNEL_RING_DEPTH;
            sock_cfg.tx_size = KERNEL_RING_DEPTH;
            sock_cfg.xdp_flags = 0;
            sock_cfg.bind_flags = XDP_USE_NEED_WAKEUP;

            let c_ifname = CString::new(if_name)
                .map_err(|_| SetupError::Port("interface name contains NUL".into()))?;
            let mut sock_handle: *mut libbpf_sys::xsk_socket = ptr::null_mut();
            let mut rx_def: xsk_ring_cons = mem::zeroed();
            let mut tx_def: xsk_ring_prod = mem::zeroed();
            let ret = xsk_socket__create(
                &mut sock_handle,
                c_ifname.as_ptr(),
                queue_id,
                umem_handle,
                &mut rx_def,
                &mut tx_def,
                &sock_cfg,
            );
            if ret != 0 {
                xsk_umem__delete(umem_handle);
                munmap(area, UMEM_SIZE);
                return Err(SetupError::Port(format!(
                    "xsk_socket__create on {} queue {}: {}",
                    if_name, queue_id, ret
                )));
            }

            let umem = Arc::new(Umem {
                area: area as *mut u8,
                umem_handle,
                sock_handle,
            });

            // Frame split: low half TX, high half RX.
            let tx_slab = FixedSlab::new(UMEM_FRAMES / 2);
            let mut rx_slab = FixedSlab::new(UMEM_FRAMES / 2);
            let rx_base = (UMEM_FRAMES / 2) as u32;

            let mut fq = RingProd::new(&fq_def);

            // Prime the fill ring so the NIC can deliver from the first poll.
            let room = fq.available().min(KERNEL_RING_DEPTH);
            for _ in 0..room {
                match rx_slab.alloc() {
                    Some(rel) => fq.stage_addr((rx_base + rel) as u64 * UMEM_FRAME_SIZE as u64),
                    None => break,
                }
            }
            fq.commit();

            let sock_fd = xsk_socket__fd(sock_handle);
            Ok(XdpPort {
                mac,
                tx: XdpTx {
                    ring: RingProd::new(&tx_def),
                    cq: RingCons::new(&cq_def),
                    slab: tx_slab,
                    umem: umem.clone(),
                    sock_fd,
                },
                rx: XdpRx {
                    ring: RingCons::new(&rx_def),
                    fq,
                    slab: rx_slab,
                    rx_base,
                    umem,
                    descs: vec![xdp_desc { addr: 0, len: 0, options: 0 }; 256],
                },
            })
        }
    }
}

impl NicPort for XdpPort {
    type Tx = XdpTx;
    type Rx = XdpRx;

    fn mac(&self) -> Mac {
        self.mac
    }

    fn split(self) -> (XdpTx, XdpRx) {
        (self.tx, self.rx)
    }
}

// ============================================================================
// TX HALF
// ============================================================================

pub struct XdpTx {
    ring: RingProd,
    cq: RingCons,
    slab: FixedSlab,
    umem: Arc<Umem>,
    sock_fd: i32,
}

// SAFETY: driven by exactly one engine thread; UMEM access is confined to
// the TX frame half.
unsafe impl Send for XdpTx {}

impl TxPath for XdpTx {
    fn tx_burst(&mut self, pool: &FramePool, frames: &[FrameHandle]) -> usize {
        // SAFETY: ring/slab invariants per RingProd/RingCons; frame copies
        // stay inside the allocated UMEM slot.
        unsafe {
            self.cq.consume_addrs(&mut self.slab);
            let room = self.ring.available() as usize;
            let mut staged = 0;
            for h in frames.iter().take(room) {
                let Some(idx) = self.slab.alloc() else { break };
                let addr = idx as u64 * UMEM_FRAME_SIZE as u64;
                let bytes = pool.frame(*h);
                ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    self.umem.area.add(addr as usize),
                    bytes.len(),
                );
                self.ring.stage_desc(addr, h.len);
                staged += 1;
            }
            if staged > 0 {
                self.ring.commit();
                // Unconditional kick: transient errno values are queue
                // backpressure the caller's retry loop absorbs.
                sendto(self.sock_fd, ptr::null(), 0, MSG_DONTWAIT, ptr::null(), 0);
            }
            staged
        }
    }
}

// ============================================================================
// RX HALF
// ============================================================================

pub struct XdpRx {
    ring: RingCons,
    fq: RingProd,
    slab: FixedSlab,
    rx_base: u32,
    umem: Arc<Umem>,
    descs: Vec<xdp_desc>,
}

// SAFETY: driven by exactly one engine thread; UMEM access is confined to
// the RX frame half.
unsafe impl Send for XdpRx {}

impl RxPath for XdpRx {
    fn rx_burst(&mut self, pool: &mut FramePool, out: &mut [FrameHandle]) -> usize {
        // SAFETY: descriptors come from the kernel RX ring and address the
        // RX half of our UMEM; copies are bounded by FRAME_CAPACITY.
        unsafe {
            let want = out.len().min(self.descs.len());
            let got = self.ring.consume_descs(&mut self.descs[..want]);
            let mut filled = 0;
            for d in &self.descs[..got] {
                let umem_idx = (d.addr / UMEM_FRAME_SIZE as u64) as u32;
                if let Some(pool_idx) = pool.alloc() {
                    let len = (d.len as usize).min(FRAME_CAPACITY);
                    let src = self.umem.area.add(d.addr as usize);
                    pool.slot_mut(pool_idx)[..len]
                        .copy_from_slice(std::slice::from_raw_parts(src, len));
                    out[filled] = FrameHandle { idx: pool_idx, len: len as u32 };
                    filled += 1;
                }
                // Either way the UMEM frame goes back to the fill cycle.
                self.slab.free(umem_idx - self.rx_base);
            }

            let room = self.fq.available() as usize;
            let mut staged = 0;
            for _ in 0..room {
                match self.slab.alloc() {
                    Some(rel) => {
                        self.fq
                            .stage_addr((self.rx_base + rel) as u64 * UMEM_FRAME_SIZE as u64);
                        staged += 1;
                    }
                    None => break,
                }
            }
            if staged > 0 {
                self.fq.commit();
            }
            filled
        }
    }
}
