//! End-to-end simulation scenarios: full TCP conversations between two
//! simulated hosts under the round scheduler, with loss injected at the
//! delivery layer where a scenario calls for it.

use std::sync::Arc;

use slopsim_core::PolicyKind;
use slopsim_lib::SimTime;
use slopsim_net::{ShutdownHow, SockError, TcpConfig};
use slopsim_tests::{Shared, at_ms, pair_sim, pump_server, server_addr, shared};

/// Linux `tcp_info` state codes used in assertions.
const TCP_ESTABLISHED: u8 = 1;
const TCP_SYN_SENT: u8 = 2;
const TCP_SYN_RECV: u8 = 3;

// =============================================================================
// Scenario: three-way handshake timing at 5 ms latency
// =============================================================================

#[test]
fn handshake_completes_at_link_latency_steps() {
    let log: Shared<Vec<(&'static str, u64)>> = shared(Vec::new());

    let log_a = Arc::clone(&log);
    let log_b = Arc::clone(&log);

    let sim = pair_sim(
        PolicyKind::GlobalSingle,
        0,
        5,
        TcpConfig::new(),
        TcpConfig::new(),
        move |host, ctx| {
            let sock = host.open_stream();
            assert_eq!(
                host.connect(sock, server_addr(), ctx),
                Err(SockError::InProgress)
            );
            let probe = Arc::clone(&log_a);
            at_ms(ctx, 9, move |host, _ctx| {
                let state = host.get_info(sock).unwrap().state;
                probe.lock().push(("a@9", u64::from(state)));
            });
            let probe = Arc::clone(&log_a);
            at_ms(ctx, 11, move |host, _ctx| {
                let state = host.get_info(sock).unwrap().state;
                probe.lock().push(("a@11", u64::from(state)));
            });
        },
        move |host, ctx| {
            let srv = host.open_stream();
            host.listen(srv, server_addr().port, 16).unwrap();
            let probe = Arc::clone(&log_b);
            at_ms(ctx, 4, move |host, _ctx| {
                let children = host.server_children(srv).unwrap();
                probe.lock().push(("b@4/children", children.len() as u64));
            });
            let probe = Arc::clone(&log_b);
            at_ms(ctx, 6, move |host, _ctx| {
                let children = host.server_children(srv).unwrap();
                probe.lock().push(("b@6/children", children.len() as u64));
                let state = host.get_info(children[0]).unwrap().state;
                probe.lock().push(("b@6/state", u64::from(state)));
            });
            let probe = Arc::clone(&log_b);
            at_ms(ctx, 14, move |host, _ctx| {
                let blocked = host.accept(srv) == Err(SockError::WouldBlock);
                probe.lock().push(("b@14/blocked", u64::from(blocked)));
            });
            let probe = Arc::clone(&log_b);
            at_ms(ctx, 16, move |host, _ctx| {
                let (child, _peer) = host.accept(srv).expect("established by 15 ms");
                let state = host.get_info(child).unwrap().state;
                probe.lock().push(("b@16/state", u64::from(state)));
            });
        },
    );
    sim.run(SimTime::from_secs(1));

    let mut events = log.lock().clone();
    events.sort_by_key(|&(tag, _)| tag);
    let mut expect = vec![
        ("a@9", u64::from(TCP_SYN_SENT)),
        ("a@11", u64::from(TCP_ESTABLISHED)),
        ("b@4/children", 0),
        ("b@6/children", 1),
        ("b@6/state", u64::from(TCP_SYN_RECV)),
        ("b@14/blocked", 1),
        ("b@16/state", u64::from(TCP_ESTABLISHED)),
    ];
    expect.sort_by_key(|&(tag, _)| tag);
    assert_eq!(events, expect);
}

// =============================================================================
// Scenario: 4096 bytes at MSS 1448 — three segments, fully acknowledged
// =============================================================================

#[test]
fn bulk_send_is_segmented_delivered_and_acknowledged() {
    let received = shared(0usize);
    let eof = shared(false);
    let in_flight_at_end: Shared<Option<u64>> = shared(None);

    let received_b = Arc::clone(&received);
    let eof_b = Arc::clone(&eof);
    let probe_a = Arc::clone(&in_flight_at_end);

    let sim = pair_sim(
        PolicyKind::GlobalSingle,
        0,
        5,
        TcpConfig::new(),
        TcpConfig::new(),
        move |host, ctx| {
            let sock = host.open_stream();
            let _ = host.connect(sock, server_addr(), ctx);
            at_ms(ctx, 50, move |host, ctx| {
                assert_eq!(host.send(sock, &[0xab; 4096], ctx), Ok(4096));
            });
            at_ms(ctx, 500, move |host, _ctx| {
                let info = host.get_info(sock).unwrap();
                *probe_a.lock() = Some(u64::from(info.unacked));
            });
        },
        move |host, ctx| {
            let srv = host.open_stream();
            host.listen(srv, server_addr().port, 16).unwrap();
            at_ms(ctx, 20, move |host, ctx| {
                let pump = pump_server(srv, None, 10, received_b, eof_b);
                pump(host, ctx);
            });
        },
    );
    sim.run(SimTime::from_secs(2));

    assert_eq!(*received.lock(), 4096, "every byte reaches the receiver");
    assert_eq!(
        *in_flight_at_end.lock(),
        Some(0),
        "retransmit queue empty once everything is acked"
    );
}

// =============================================================================
// Scenario: single loss — fast retransmit resends only the hole
// =============================================================================

#[test]
fn single_loss_recovers_by_fast_retransmit_and_halves_cwnd() {
    let received = shared(0usize);
    let eof = shared(false);
    let egress_seqs: Shared<Vec<u32>> = shared(Vec::new());
    let cwnd_pre: Shared<Option<u32>> = shared(None);
    let cwnd_final: Shared<Option<u32>> = shared(None);

    let received_b = Arc::clone(&received);
    let eof_b = Arc::clone(&eof);
    let seq_log = Arc::clone(&egress_seqs);
    let pre = Arc::clone(&cwnd_pre);
    let fin = Arc::clone(&cwnd_final);

    let sim = pair_sim(
        PolicyKind::GlobalSingle,
        0,
        5,
        TcpConfig::new(),
        TcpConfig::new(),
        move |host, ctx| {
            // Delivery-layer loss: sequence 2 vanishes exactly once.
            let mut dropped = false;
            host.set_egress_filter(move |pkt| {
                let seq = pkt.header.seq;
                if seq == 2 && !dropped {
                    dropped = true;
                    return false;
                }
                if seq != 0 {
                    seq_log.lock().push(seq);
                }
                true
            });

            let sock = host.open_stream();
            let _ = host.connect(sock, server_addr(), ctx);
            // First segment alone, so the peer's cumulative ack reaches 2
            // before the loss-trailing segments arrive.
            at_ms(ctx, 100, move |host, ctx| {
                assert_eq!(host.send(sock, &[1u8; 1448], ctx), Ok(1448));
            });
            at_ms(ctx, 115, move |host, ctx| {
                assert_eq!(host.send(sock, &[2u8; 4 * 1448], ctx), Ok(4 * 1448));
            });
            at_ms(ctx, 120, move |host, _ctx| {
                *pre.lock() = Some(host.get_info(sock).unwrap().snd_cwnd);
            });
            at_ms(ctx, 400, move |host, _ctx| {
                let info = host.get_info(sock).unwrap();
                *fin.lock() = Some(info.snd_cwnd);
                assert_eq!(info.unacked, 0);
                assert_eq!(info.total_retrans, 1);
            });
        },
        move |host, ctx| {
            let srv = host.open_stream();
            host.listen(srv, server_addr().port, 16).unwrap();
            at_ms(ctx, 20, move |host, ctx| {
                let pump = pump_server(srv, None, 10, received_b, eof_b);
                pump(host, ctx);
            });
        },
    );
    sim.run(SimTime::from_secs(2));

    assert_eq!(*received.lock(), 5 * 1448, "stream is complete after recovery");

    let seqs = egress_seqs.lock().clone();
    let occurrences = |seq: u32| seqs.iter().filter(|&&s| s == seq).count();
    // Sequence 2 was transmitted twice (original dropped + fast
    // retransmit); everything else exactly once.
    assert_eq!(occurrences(2), 1, "only the retransmission passed the filter");
    for seq in [1, 3, 4, 5] {
        assert_eq!(occurrences(seq), 1, "seq {seq} must not be retransmitted");
    }

    let pre = cwnd_pre.lock().expect("pre-loss cwnd recorded");
    let after = cwnd_final.lock().expect("final cwnd recorded");
    assert_eq!(after, pre / 2, "loss halves the congestion window");
}

// =============================================================================
// Scenario: retransmission timeout — backoff, requeue, late ack
// =============================================================================

#[test]
fn lost_ack_triggers_rto_backoff_and_recovery() {
    let received = shared(0usize);
    let eof = shared(false);
    let final_info: Shared<Option<(u32, u32)>> = shared(None);

    let received_b = Arc::clone(&received);
    let eof_b = Arc::clone(&eof);
    let probe = Arc::clone(&final_info);

    let sim = pair_sim(
        PolicyKind::GlobalSingle,
        0,
        5,
        TcpConfig::new(),
        TcpConfig::new(),
        move |host, ctx| {
            let sock = host.open_stream();
            let _ = host.connect(sock, server_addr(), ctx);
            at_ms(ctx, 100, move |host, ctx| {
                assert_eq!(host.send(sock, &[7u8; 100], ctx), Ok(100));
            });
            at_ms(ctx, 800, move |host, _ctx| {
                let info = host.get_info(sock).unwrap();
                *probe.lock() = Some((info.retransmits, info.unacked));
            });
        },
        move |host, ctx| {
            // The acknowledgment of the first data segment is lost.
            let mut dropped = false;
            host.set_egress_filter(move |pkt| {
                let is_data_ack = pkt.header.has_ack()
                    && !pkt.header.is_syn_ack()
                    && pkt.header.ack == 2;
                if is_data_ack && !dropped {
                    dropped = true;
                    return false;
                }
                true
            });
            let srv = host.open_stream();
            host.listen(srv, server_addr().port, 16).unwrap();
            at_ms(ctx, 20, move |host, ctx| {
                let pump = pump_server(srv, None, 10, received_b, eof_b);
                pump(host, ctx);
            });
        },
    );
    sim.run(SimTime::from_secs(2));

    // One timeout episode: the timer fired once, doubled the RTO, and the
    // retransmission was acknowledged.
    assert_eq!(*final_info.lock(), Some((1, 0)));
    assert_eq!(*received.lock(), 100, "duplicate delivery is discarded");
}

// =============================================================================
// Scenario: serial and parallel schedulers deliver identical streams
// =============================================================================

#[test]
fn every_policy_delivers_the_same_stream() {
    fn run_transfer(kind: PolicyKind, workers: usize) -> usize {
        let received = shared(0usize);
        let eof = shared(false);
        let received_b = Arc::clone(&received);
        let eof_b = Arc::clone(&eof);

        let sim = pair_sim(
            kind,
            workers,
            10,
            TcpConfig::new(),
            TcpConfig::new(),
            move |host, ctx| {
                let sock = host.open_stream();
                let _ = host.connect(sock, server_addr(), ctx);
                at_ms(ctx, 100, move |host, ctx| {
                    assert_eq!(host.send(sock, &[9u8; 4096], ctx), Ok(4096));
                });
                at_ms(ctx, 400, move |host, ctx| {
                    let _ = host.shutdown(sock, ShutdownHow::Write, ctx);
                });
            },
            move |host, ctx| {
                let srv = host.open_stream();
                host.listen(srv, server_addr().port, 16).unwrap();
                at_ms(ctx, 20, move |host, ctx| {
                    let pump = pump_server(srv, None, 10, received_b, eof_b);
                    pump(host, ctx);
                });
            },
        );
        sim.run(SimTime::from_secs(5));
        assert!(*eof.lock(), "{kind:?}: receiver must observe end-of-stream");
        let total = *received.lock();
        total
    }

    let reference = run_transfer(PolicyKind::GlobalSingle, 0);
    assert_eq!(reference, 4096);
    for kind in [
        PolicyKind::HostSingle,
        PolicyKind::ThreadSingle,
        PolicyKind::ThreadPerHost,
    ] {
        assert_eq!(run_transfer(kind, 2), reference, "{kind:?} diverged");
    }
}

// =============================================================================
// Scenario: close with pending data — FIN waits for the drain
// =============================================================================

#[test]
fn close_with_queued_data_drains_before_the_fin() {
    const PAYLOAD: usize = 8 * 1448;

    let received = shared(0usize);
    let eof = shared(false);
    let torn_down = shared(false);

    let received_b = Arc::clone(&received);
    let eof_b = Arc::clone(&eof);
    let done_a = Arc::clone(&torn_down);

    let mut cfg_a = TcpConfig::new();
    cfg_a.time_wait_ms = 100;
    // The receiver advertises a two-segment window and never grows it, so
    // the sender still holds queued data when the user closes.
    let mut cfg_b = TcpConfig::new();
    cfg_b.autotune = false;
    cfg_b.recv_buf_initial = 2 * cfg_b.mss;

    let sim = pair_sim(
        PolicyKind::GlobalSingle,
        0,
        5,
        cfg_a,
        cfg_b,
        move |host, ctx| {
            let sock = host.open_stream();
            let _ = host.connect(sock, server_addr(), ctx);
            at_ms(ctx, 100, move |host, ctx| {
                assert_eq!(host.send(sock, &[4u8; PAYLOAD], ctx), Ok(PAYLOAD));
                // Close immediately: most of the payload is still queued
                // behind the peer's two-segment window.
                host.close(sock, ctx).unwrap();
                assert_eq!(
                    host.get_info(sock).unwrap().state,
                    TCP_ESTABLISHED,
                    "FIN must wait for the drain"
                );
            });
            at_ms(ctx, 3_000, move |host, _ctx| {
                // After drain, FIN walk and TIME_WAIT dwell, the socket is
                // gone entirely.
                *done_a.lock() = host.get_info(sock) == Err(SockError::BadHandle);
            });
        },
        move |host, ctx| {
            let srv = host.open_stream();
            host.listen(srv, server_addr().port, 16).unwrap();
            at_ms(ctx, 20, move |host, ctx| {
                let pump = pump_server(srv, None, 10, received_b, eof_b);
                pump(host, ctx);
            });
        },
    );
    sim.run(SimTime::from_secs(10));

    assert_eq!(*received.lock(), PAYLOAD, "all queued data drains first");
    assert!(*eof.lock(), "receiver sees end-of-stream after the payload");
    assert!(*torn_down.lock(), "sender socket fully closed and reaped");
}

// =============================================================================
// Loopback: both endpoints on one host
// =============================================================================

#[test]
fn loopback_connection_transfers_and_gets_maximum_buffers() {
    let received = shared(0usize);
    let eof = shared(false);
    let rcv_space: Shared<Option<u32>> = shared(None);

    let received_b = Arc::clone(&received);
    let eof_b = Arc::clone(&eof);
    let probe = Arc::clone(&rcv_space);

    let sim = pair_sim(
        PolicyKind::GlobalSingle,
        0,
        5,
        TcpConfig::new(),
        TcpConfig::new(),
        move |host, ctx| {
            let srv = host.open_stream();
            host.listen(srv, server_addr().port, 16).unwrap();
            at_ms(ctx, 20, move |host, ctx| {
                let pump = pump_server(srv, None, 10, received_b, eof_b);
                pump(host, ctx);
            });

            // Dial our own address: the connection never leaves the host.
            let sock = host.open_stream();
            let _ = host.connect(
                sock,
                slopsim_net::SockAddr::new(host.ip(), server_addr().port),
                ctx,
            );
            at_ms(ctx, 200, move |host, ctx| {
                assert_eq!(host.send(sock, &[6u8; 2_000], ctx), Ok(2_000));
            });
            at_ms(ctx, 400, move |host, ctx| {
                *probe.lock() = Some(host.get_info(sock).unwrap().rcv_space);
                let _ = host.shutdown(sock, ShutdownHow::Write, ctx);
            });
        },
        |_host, _ctx| {},
    );
    sim.run(SimTime::from_secs(5));

    assert_eq!(*received.lock(), 2_000);
    assert!(*eof.lock());
    assert_eq!(
        *rcv_space.lock(),
        Some(TcpConfig::new().recv_buf_max as u32),
        "loopback autotunes to the configured maximum"
    );
}

// =============================================================================
// Determinism: identical runs, identical event counts
// =============================================================================

#[test]
fn identical_parallel_runs_are_deterministic() {
    fn run_once() -> (u64, u64, usize) {
        let received = shared(0usize);
        let eof = shared(false);
        let received_b = Arc::clone(&received);
        let eof_b = Arc::clone(&eof);

        let sim = pair_sim(
            PolicyKind::ThreadSingle,
            2,
            10,
            TcpConfig::new(),
            TcpConfig::new(),
            move |host, ctx| {
                let sock = host.open_stream();
                let _ = host.connect(sock, server_addr(), ctx);
                at_ms(ctx, 100, move |host, ctx| {
                    let _ = host.send(sock, &[3u8; 10_000], ctx);
                });
                at_ms(ctx, 500, move |host, ctx| {
                    let _ = host.shutdown(sock, ShutdownHow::Write, ctx);
                });
            },
            move |host, ctx| {
                let srv = host.open_stream();
                host.listen(srv, server_addr().port, 16).unwrap();
                at_ms(ctx, 20, move |host, ctx| {
                    let pump = pump_server(srv, None, 10, received_b, eof_b);
                    pump(host, ctx);
                });
            },
        );
        sim.run(SimTime::from_secs(5));
        (sim.total_pushes(), sim.total_pops(), *received.lock())
    }

    let first = run_once();
    let second = run_once();
    assert_eq!(first, second);
    assert_eq!(first.2, 10_000);
}
