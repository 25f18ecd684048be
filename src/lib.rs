// SIGPORT — user-space L2 datagram endpoint for kernel-bypass NICs.
// Two variants over one skeleton: URP (unreliable, EtherType 0x88B6) and
// SRP (reliable in-order, cumulative ACK + window retransmit, 0x88B5).
//
// engine/   — SPSC rings, payload records, wire format, runtime support
// network/  — frame pools, NIC port contract, sim link, URP/SRP endpoints

pub mod engine;
pub mod network;
