// SIGPORT — Orchestrator
// Demo/bench harness around the endpoint core. Three modes:
//   --mode loopback  (default) both endpoints in-process over the sim link:
//                    producer → A → wire → B → echo → wire → A → consumer,
//                    TSC-stamped payloads, periodic RTT/throughput lines
//   --mode send      drive a real interface as the load generator (xdp build)
//   --mode echo      echo responder on a real interface (xdp build)

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use sigport::engine::payload::{PayloadReceiver, PayloadSender, SubmitError};
use sigport::engine::runtime::{
    calibrate_tsc, cpu_pause, discover_isolated_cores, fatal, pin_to_core, tsc_ns, E_BAD_ARGS,
    E_THREAD_SPAWN, TscCal,
};
use sigport::engine::wire::Mac;
use sigport::network::sim::sim_pair;
use sigport::network::{srp, urp, Config};

#[cfg(not(feature = "xdp"))]
use sigport::engine::runtime::E_NO_BACKEND;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

const REPORT_INTERVAL: u64 = 100_000;

#[derive(Copy, Clone, PartialEq)]
enum Mode {
    Loopback,
    Send,
    Echo,
}

fn arg_value<T: FromStr>(args: &[String], i: usize, what: &str) -> T {
    match args.get(i).and_then(|s| s.parse().ok()) {
        Some(v) => v,
        None => {
            eprintln!("[SIG-EXEC] missing or invalid value for {}", what);
            fatal(E_BAD_ARGS, what)
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut cfg = Config::default();
    let mut mode = Mode::Loopback;
    let mut srp_mode = false;
    let mut if_name = "veth0".to_string();
    let mut count: u64 = 1_000_000;
    let mut base_core: Option<usize> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-p" | "--port" => {
                i += 1;
                cfg.port_id = arg_value(&args, i, "port id");
            }
            "-tx" | "--tx-burst" => {
                i += 1;
                cfg.tx_burst = arg_value(&args, i, "tx burst");
            }
            "-rx" | "--rx-burst" => {
                i += 1;
                cfg.rx_burst = arg_value(&args, i, "rx burst");
            }
            "--size" => {
                i += 1;
                cfg.unit_size = arg_value(&args, i, "unit size");
            }
            "--ring" => {
                i += 1;
                cfg.ring_size = arg_value(&args, i, "ring size");
            }
            "--window" => {
                i += 1;
                cfg.window = arg_value(&args, i, "window");
            }
            "--peer" => {
                i += 1;
                cfg.default_peer_mac = arg_value(&args, i, "peer mac");
            }
            "--count" => {
                i += 1;
                count = arg_value(&args, i, "count");
            }
            "--core" => {
                i += 1;
                base_core = Some(arg_value(&args, i, "core id"));
            }
            "-i" | "--iface" => {
                i += 1;
                if_name = arg_value(&args, i, "interface name");
            }
            "--srp" => srp_mode = true,
            "--urp" => srp_mode = false,
            "--mode" => {
                i += 1;
                mode = match args.get(i).map(String::as_str) {
                    Some("loopback") => Mode::Loopback,
                    Some("send") => Mode::Send,
                    Some("echo") => Mode::Echo,
                    _ => fatal(E_BAD_ARGS, "mode must be loopback, send or echo"),
                };
            }
            other => {
                eprintln!("[SIG-EXEC] unknown argument '{}'", other);
                fatal(E_BAD_ARGS, "unknown argument");
            }
        }
        i += 1;
    }

    // SAFETY: the handler performs a single relaxed atomic store, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    let isolated = discover_isolated_cores();
    if !isolated.is_empty() {
        eprintln!("[SIG-EXEC] isolated cores available: {:?}", isolated);
    }
    let cal = calibrate_tsc();

    eprintln!(
        "[SIG-EXEC] variant={} mode={} ring={} tx_burst={} rx_burst={} unit={} window={}",
        if srp_mode { "SRP" } else { "URP" },
        match mode {
            Mode::Loopback => "loopback",
            Mode::Send => "send",
            Mode::Echo => "echo",
        },
        cfg.ring_size,
        cfg.tx_burst,
        cfg.rx_burst,
        cfg.unit_size,
        cfg.window,
    );

    match mode {
        Mode::Loopback => run_loopback(cfg, srp_mode, count, base_core, cal),
        Mode::Send | Mode::Echo => run_iface(cfg, srp_mode, mode, &if_name, count, base_core, cal),
    }
}

// ── Worker loops shared by every mode ───────────────────────────────────

/// Fill and submit `count` TSC-stamped payloads, spinning on backpressure.
fn producer_loop(mut sender: PayloadSender, count: u64, cal: TscCal) {
    let mut submitted = 0u64;
    while submitted < count && !SHUTDOWN.load(Ordering::Relaxed) {
        let mut p = loop {
            match sender.acquire() {
                Some(p) => break p,
                None => {
                    if SHUTDOWN.load(Ordering::Relaxed) {
                        return;
                    }
                    cpu_pause();
                }
            }
        };
        p.set_bytes(&tsc_ns(&cal).to_le_bytes());
        let mut record = p;
        loop {
            match sender.submit(record) {
                Ok(()) => break,
                Err(SubmitError::Full(back)) => {
                    if SHUTDOWN.load(Ordering::Relaxed) {
                        return;
                    }
                    record = back;
                    cpu_pause();
                }
                Err(SubmitError::Oversize(_)) => fatal(E_BAD_ARGS, "oversize payload"),
            }
        }
        submitted += 1;
    }
    eprintln!("[SIG-PROD] submitted {} payloads", submitted);
}

/// Drain `count` payloads, folding the embedded timestamps into RTT and
/// throughput report lines.
fn consumer_loop(mut receiver: PayloadReceiver, count: u64, cal: TscCal) {
    let mut received = 0u64;
    let mut rtt_sum_ns = 0u64;
    let mut last_report_ns = tsc_ns(&cal);
    while received < count && !SHUTDOWN.load(Ordering::Relaxed) {
        let Some(p) = receiver.recv() else {
            cpu_pause();
            continue;
        };
        received += 1;
        if p.size >= 8 {
            let stamp = u64::from_le_bytes(p.bytes()[..8].try_into().unwrap());
            rtt_sum_ns += tsc_ns(&cal).saturating_sub(stamp);
        }
        receiver.release(p);
        if received % REPORT_INTERVAL == 0 {
            let now = tsc_ns(&cal);
            let secs = (now - last_report_ns) as f64 / 1e9;
            eprintln!(
                "[SIG-LOOP] rx={} throughput={:.0} msg/s rtt_avg={:.1} us",
                received,
                REPORT_INTERVAL as f64 / secs,
                rtt_sum_ns as f64 / REPORT_INTERVAL as f64 / 1000.0,
            );
            rtt_sum_ns = 0;
            last_report_ns = now;
        }
    }
    eprintln!("[SIG-LOOP] consumer done: {} payloads", received);
}

/// Bounce every inbound payload straight back out.
fn echo_loop(mut sender: PayloadSender, mut receiver: PayloadReceiver) {
    while !SHUTDOWN.load(Ordering::Relaxed) {
        let Some(msg) = receiver.recv() else {
            cpu_pause();
            continue;
        };
        let mut resp = loop {
            match sender.acquire() {
                Some(p) => break p,
                None => {
                    if SHUTDOWN.load(Ordering::Relaxed) {
                        receiver.release(msg);
                        return;
                    }
                    cpu_pause();
                }
            }
        };
        resp.set_bytes(msg.bytes());
        receiver.release(msg);
        let mut record = resp;
        loop {
            match sender.submit(record) {
                Ok(()) => break,
                Err(SubmitError::Full(back)) => {
                    if SHUTDOWN.load(Ordering::Relaxed) {
                        return;
                    }
                    record = back;
                    cpu_pause();
                }
                Err(SubmitError::Oversize(_)) => return,
            }
        }
    }
}

fn spawn_pinned<F: FnOnce() + Send + 'static>(
    name: &str,
    core: Option<usize>,
    f: F,
) -> std::thread::JoinHandle<()> {
    let name_owned = name.to_string();
    std::thread::Builder::new()
        .name(name_owned.clone())
        .spawn(move || {
            if let Some(c) = core {
                if !pin_to_core(c) {
                    eprintln!("[SIG-EXEC] WARNING: could not pin {} to core {}", name_owned, c);
                }
            }
            f();
        })
        .unwrap_or_else(|_| fatal(E_THREAD_SPAWN, "engine thread spawn failed"))
}

// ── Loopback mode ───────────────────────────────────────────────────────

fn run_loopback(cfg: Config, srp_mode: bool, count: u64, base_core: Option<usize>, cal: TscCal) {
    const MAC_A: Mac = Mac([0x02, 0x53, 0x49, 0x47, 0x00, 0x0A]);
    const MAC_B: Mac = Mac([0x02, 0x53, 0x49, 0x47, 0x00, 0x0B]);
    let (port_a, port_b) = sim_pair(MAC_A, MAC_B, 8192);
    let core = |n: usize| base_core.map(|b| b + n);

    let mut joins = Vec::new();
    let sender;
    let receiver;
    let counters;

    if srp_mode {
        let a = srp::bootstrap(cfg.clone(), port_a)
            .unwrap_or_else(|e| fatal(e.code(), &e.to_string()));
        let b = srp::bootstrap(cfg, port_b).unwrap_or_else(|e| fatal(e.code(), &e.to_string()));
        let (mut a_tx, mut a_rx) = (a.tx, a.rx);
        let (mut b_tx, mut b_rx) = (b.tx, b.rx);
        a_tx.set_clock(cal);
        b_tx.set_clock(cal);
        joins.push(spawn_pinned("sig-tx-a", core(0), move || a_tx.run(&SHUTDOWN)));
        joins.push(spawn_pinned("sig-rx-a", core(1), move || a_rx.run(&SHUTDOWN)));
        joins.push(spawn_pinned("sig-tx-b", core(2), move || b_tx.run(&SHUTDOWN)));
        joins.push(spawn_pinned("sig-rx-b", core(3), move || b_rx.run(&SHUTDOWN)));
        let (b_sender, b_receiver) = (b.sender, b.receiver);
        joins.push(spawn_pinned("sig-echo", core(4), move || echo_loop(b_sender, b_receiver)));
        sender = a.sender;
        receiver = a.receiver;
        counters = a.counters;
    } else {
        let a = urp::bootstrap(cfg.clone(), port_a)
            .unwrap_or_else(|e| fatal(e.code(), &e.to_string()));
        let b = urp::bootstrap(cfg, port_b).unwrap_or_else(|e| fatal(e.code(), &e.to_string()));
        let (mut a_tx, mut a_rx) = (a.tx, a.rx);
        let (mut b_tx, mut b_rx) = (b.tx, b.rx);
        joins.push(spawn_pinned("sig-tx-a", core(0), move || a_tx.run(&SHUTDOWN)));
        joins.push(spawn_pinned("sig-rx-a", core(1), move || a_rx.run(&SHUTDOWN)));
        joins.push(spawn_pinned("sig-tx-b", core(2), move || b_tx.run(&SHUTDOWN)));
        joins.push(spawn_pinned("sig-rx-b", core(3), move || b_rx.run(&SHUTDOWN)));
        let (b_sender, b_receiver) = (b.sender, b.receiver);
        joins.push(spawn_pinned("sig-echo", core(4), move || echo_loop(b_sender, b_receiver)));
        sender = a.sender;
        receiver = a.receiver;
        counters = a.counters;
    }

    joins.push(spawn_pinned("sig-prod", core(5), move || producer_loop(sender, count, cal)));
    consumer_loop(receiver, count, cal);

    SHUTDOWN.store(true, Ordering::Relaxed);
    for j in joins {
        let _ = j.join();
    }
    eprintln!(
        "[SIG-EXEC] done: tx={} rx={} malformed={} ooo={} acks_tx={} acks_rx={} rtx_bursts={} ring_full={}",
        counters.tx_frames.value.load(Ordering::Relaxed),
        counters.rx_frames.value.load(Ordering::Relaxed),
        counters.rx_malformed.value.load(Ordering::Relaxed),
        counters.rx_out_of_order.value.load(Ordering::Relaxed),
        counters.acks_tx.value.load(Ordering::Relaxed),
        counters.acks_rx.value.load(Ordering::Relaxed),
        counters.retransmit_bursts.value.load(Ordering::Relaxed),
        counters.ring_full.value.load(Ordering::Relaxed),
    );
}

// ── Real-interface modes (AF_XDP backend) ───────────────────────────────

#[cfg(feature = "xdp")]
fn run_iface(
    cfg: Config,
    srp_mode: bool,
    mode: Mode,
    if_name: &str,
    count: u64,
    base_core: Option<usize>,
    cal: TscCal,
) {
    use sigport::network::xdp::XdpPort;
    use sigport::network::NicPort;

    let port = XdpPort::open(if_name, cfg.port_id as u32)
        .unwrap_or_else(|e| fatal(e.code(), &e.to_string()));
    eprintln!("[SIG-EXEC] AF_XDP up on {} queue {} mac={}", if_name, cfg.port_id, port.mac());
    let core = |n: usize| base_core.map(|b| b + n);

    let mut joins = Vec::new();
    let sender;
    let receiver;
    if srp_mode {
        let ep = srp::bootstrap(cfg, port).unwrap_or_else(|e| fatal(e.code(), &e.to_string()));
        let (mut tx, mut rx) = (ep.tx, ep.rx);
        tx.set_clock(cal);
        joins.push(spawn_pinned("sig-tx", core(0), move || tx.run(&SHUTDOWN)));
        joins.push(spawn_pinned("sig-rx", core(1), move || rx.run(&SHUTDOWN)));
        sender = ep.sender;
        receiver = ep.receiver;
    } else {
        let ep = urp::bootstrap(cfg, port).unwrap_or_else(|e| fatal(e.code(), &e.to_string()));
        let (mut tx, mut rx) = (ep.tx, ep.rx);
        joins.push(spawn_pinned("sig-tx", core(0), move || tx.run(&SHUTDOWN)));
        joins.push(spawn_pinned("sig-rx", core(1), move || rx.run(&SHUTDOWN)));
        sender = ep.sender;
        receiver = ep.receiver;
    }

    match mode {
        Mode::Send => {
            joins
                .push(spawn_pinned("sig-prod", core(2), move || producer_loop(sender, count, cal)));
            consumer_loop(receiver, count, cal);
            SHUTDOWN.store(true, Ordering::Relaxed);
        }
        _ => echo_loop(sender, receiver),
    }
    for j in joins {
        let _ = j.join();
    }
}

#[cfg(not(feature = "xdp"))]
fn run_iface(
    _cfg: Config,
    _srp_mode: bool,
    _mode: Mode,
    _if_name: &str,
    _count: u64,
    _base_core: Option<usize>,
    _cal: TscCal,
) {
    fatal(E_NO_BACKEND, "built without the xdp feature; rebuild with --features xdp");
}
