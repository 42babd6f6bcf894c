//! Two-rank end-to-end flows over the in-process fabric domain: direct
//! connection calls, GPU-initiated transfers through a fifo + proxy, and
//! plan replay.

use proxima::{
    BufferRef, Connection, ExecutionPlan, FabricDomain, Fifo, Host, Host2HostSemaphore,
    PeerBinding, PlanExecutor, PlanStep, ProximaConfig, ProxyService, Trigger, TransportKind,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fabric_pair() -> (Arc<Connection>, Arc<Connection>) {
    let domain = FabricDomain::default();
    let (ea, eb) = domain.endpoint_pair(TransportKind::NetworkFabric, 0, 1);
    (
        Arc::new(Connection::connect(ea).unwrap()),
        Arc::new(Connection::connect(eb).unwrap()),
    )
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn register(conn: &Connection, buf: &[u8]) -> proxima::MemoryHandle {
    conn.register(unsafe { BufferRef::<Host>::new(buf.as_ptr() as u64, buf.len()) })
        .unwrap()
}

#[test]
fn write_flush_signal_wait_roundtrip() {
    init_tracing();
    for size in [4 * 1024usize, 1024 * 1024] {
        let (conn_a, conn_b) = fabric_pair();
        let (sem_a, sem_b) = Host2HostSemaphore::pair(Arc::clone(&conn_a), conn_b).unwrap();

        let src = pattern(size);
        let dst = vec![0u8; size];
        let src_mem = register(&conn_a, &src);
        let dst_mem = register(&conn_a, &dst);

        // Rank 1 waits for the signal, then reads back.
        let expected = src.clone();
        let dst_probe = dst.as_ptr() as u64;
        let waiter = thread::spawn(move || {
            sem_b.wait(Duration::from_secs(5)).unwrap();
            let seen = unsafe { std::slice::from_raw_parts(dst_probe as *const u8, size) };
            assert_eq!(seen, &expected[..], "payload mismatch at size {size}");
        });

        // Rank 0: write, flush, signal.
        conn_a.write(&dst_mem, 0, &src_mem, 0, size as u64).unwrap();
        conn_a.flush().unwrap();
        sem_a.signal().unwrap();

        waiter.join().unwrap();
    }
}

#[test]
fn gpu_initiated_transfer_through_proxy() {
    init_tracing();
    let size = 64 * 1024usize;
    let (conn_a, conn_b) = fabric_pair();
    let (sem_a, sem_b) = Host2HostSemaphore::pair(Arc::clone(&conn_a), conn_b).unwrap();

    let src = pattern(size);
    let dst = vec![0u8; size];

    let fifo = Fifo::new(64);
    let mut proxy = ProxyService::new(fifo.clone(), ProximaConfig::default());
    let cid = proxy.add_connection(Arc::clone(&conn_a)).unwrap();
    let sid = proxy.add_semaphore(Arc::new(sem_a)).unwrap();
    let src_id = proxy.add_memory(register(&conn_a, &src)).unwrap();
    let dst_id = proxy.add_memory(register(&conn_a, &dst)).unwrap();
    proxy.start().unwrap();

    // A kernel thread requests the transfer without any host call: it only
    // writes trigger records into the shared fifo.
    let producer = fifo.clone();
    let kernel = thread::spawn(move || {
        producer
            .push_timeout(
                Trigger::write(cid, src_id, 0, dst_id, 0, size as u64),
                Duration::from_secs(1),
            )
            .unwrap();
        producer
            .push_timeout(Trigger::flush(cid), Duration::from_secs(1))
            .unwrap();
        producer
            .push_timeout(Trigger::signal(sid), Duration::from_secs(1))
            .unwrap();
    });

    sem_b.wait(Duration::from_secs(5)).unwrap();
    assert_eq!(dst, src);

    kernel.join().unwrap();
    proxy.stop().unwrap();
    assert!(fifo.is_empty());
}

#[test]
fn plan_replay_send_recv_between_ranks() {
    init_tracing();
    let size = 8 * 1024usize;
    let (conn_a, conn_b) = fabric_pair();
    let (sem_a, sem_b) = Host2HostSemaphore::pair(Arc::clone(&conn_a), Arc::clone(&conn_b)).unwrap();
    let (sem_a, sem_b) = (Arc::new(sem_a), Arc::new(sem_b));

    let send_a = pattern(size);
    let recv_b = vec![0u8; size];

    // Rank 0's proxy carries the triggers its executor issues.
    let fifo_a = Fifo::new(32);
    let mut proxy_a = ProxyService::new(fifo_a.clone(), ProximaConfig::default());
    let cid = proxy_a.add_connection(Arc::clone(&conn_a)).unwrap();
    let sid = proxy_a.add_semaphore(Arc::clone(&sem_a)).unwrap();
    let send_id = proxy_a.add_memory(register(&conn_a, &send_a)).unwrap();
    let recv_id = proxy_a.add_memory(register(&conn_a, &recv_b)).unwrap();
    proxy_a.start().unwrap();

    let mut executor_a = PlanExecutor::new(fifo_a.clone(), Duration::from_secs(5));
    executor_a.bind_peer(
        1,
        PeerBinding {
            connection_id: cid,
            semaphore_id: sid,
            semaphore: Arc::clone(&sem_a),
            send_memory_id: send_id,
            remote_recv_memory_id: recv_id,
        },
    );

    let mut executor_b = PlanExecutor::new(Fifo::new(32), Duration::from_secs(5));
    executor_b.bind_peer(
        0,
        PeerBinding {
            connection_id: 0,
            semaphore_id: 0,
            semaphore: Arc::clone(&sem_b),
            send_memory_id: 0,
            remote_recv_memory_id: 0,
        },
    );

    let plan_a = ExecutionPlan {
        name: "send".into(),
        steps: vec![
            PlanStep::Send {
                peer: 1,
                src_offset: 0,
                dst_offset: 0,
                size: size as u64,
            },
            PlanStep::Signal { peer: 1 },
        ],
    };
    let plan_b = ExecutionPlan {
        name: "recv".into(),
        steps: vec![PlanStep::Recv { peer: 0 }],
    };

    let recv_probe = recv_b.as_ptr() as u64;
    let rank_b = thread::spawn(move || {
        executor_b
            .execute(
                1,
                0,
                recv_probe,
                0,
                size,
                proxima::DataType::U8,
                &plan_b,
                0,
            )
            .unwrap();
    });

    executor_a
        .execute(
            0,
            send_a.as_ptr() as u64,
            0,
            size,
            0,
            proxima::DataType::U8,
            &plan_a,
            0,
        )
        .unwrap();

    rank_b.join().unwrap();
    assert_eq!(recv_b, send_a);
    proxy_a.stop().unwrap();
}

#[test]
fn multicast_reaches_every_bound_region() {
    init_tracing();
    let domain = FabricDomain::new(2);
    let (ea, eb) = domain.endpoint_pair(TransportKind::MulticastFabric, 0, 1);
    let root = Connection::connect(ea).unwrap();
    let leaf = Connection::connect(eb).unwrap();

    let size = 4096usize;
    let payload = pattern(size);
    let mirror_a = vec![0u8; size];
    let mirror_b = vec![0u8; size];

    let ha = leaf
        .bind_multicast(unsafe {
            BufferRef::<proxima::Device>::new(mirror_a.as_ptr() as u64, size)
        })
        .unwrap();
    let _hb = leaf
        .bind_multicast(unsafe {
            BufferRef::<proxima::Device>::new(mirror_b.as_ptr() as u64, size)
        })
        .unwrap();

    let src_mem = root
        .register(unsafe { BufferRef::<proxima::Device>::new(payload.as_ptr() as u64, size) })
        .unwrap();
    root.write(ha.memory(), 0, &src_mem, 0, size as u64).unwrap();
    root.flush().unwrap();

    assert_eq!(mirror_a, payload);
    assert_eq!(mirror_b, payload);
}
