//! Integration tests for the memcached RDMA benchmark over the loopback fabric

use mc_rdma_bench::transport::{FaultPlan, LoopbackOptions};
use mc_rdma_bench::{
    BenchConfig, BenchError, Command, ConfigError, Connection, ContextState, Driver, Encoding,
    LoopbackFabric, StopReason, TemplateTable,
};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mc_rdma_bench=debug")
        .try_init();
}

fn config(threads: usize, requests: u64) -> BenchConfig {
    let mut config = BenchConfig {
        threads,
        requests_per_thread: requests,
        ..Default::default()
    };
    config.transport.recv_slots = 16;
    config
}

#[test]
fn test_four_threads_without_reply_wait_complete() {
    init_tracing();
    let fabric = LoopbackFabric::default();
    let driver = Driver::new(config(4, 1000), Arc::new(fabric.clone())).unwrap();
    let report = driver.run();

    assert_eq!(report.contexts.len(), 4);
    for c in &report.contexts {
        assert_eq!(c.completed, 1000, "context {}", c.context);
        assert_eq!(c.state, ContextState::Done);
        assert_eq!(c.stop_reason, StopReason::Completed);
        assert!(c.error.is_none());
        assert_eq!(c.teardown.failures, 0);
    }
    assert_eq!(report.total_requests, 4000);
    assert_eq!(report.complete_contexts, 4);
    assert_eq!(report.stopped_early, 0);
    assert!(!report.has_failures());

    assert_eq!(fabric.requests_received(), 4000);
    assert_eq!(fabric.replies_sent(), 0);
    assert_eq!(fabric.active_registrations(), 0);
}

#[test]
fn test_reply_wait_in_both_protocols() {
    init_tracing();
    for encoding in [Encoding::Text, Encoding::Binary] {
        let fabric = LoopbackFabric::default();
        let mut cfg = config(2, 200);
        cfg.protocol = encoding;
        cfg.reply_wait = true;
        cfg.verbose = true;
        cfg.request_size = 512;

        let report = Driver::new(cfg, Arc::new(fabric.clone())).unwrap().run();
        assert_eq!(report.total_requests, 400, "{encoding}");
        assert_eq!(report.total_replies, 400, "{encoding}");
        assert_eq!(fabric.replies_sent(), 400);
        assert_eq!(fabric.active_registrations(), 0);
    }
}

#[test]
fn test_concurrent_connections_leave_no_registrations() {
    init_tracing();
    let fabric = LoopbackFabric::default();
    let cfg = config(1, 0);

    std::thread::scope(|scope| {
        for id in 0..8 {
            let fabric = &fabric;
            let cfg = &cfg;
            scope.spawn(move || {
                let conn = Connection::open(fabric, cfg, id).unwrap();
                assert_eq!(conn.pool_stats().registered, 16);
                let summary = conn.close();
                assert_eq!(summary.deregistered_slots, 16);
                assert_eq!(summary.failures, 0);
            });
        }
    });

    assert_eq!(fabric.connections(), 8);
    assert_eq!(fabric.active_registrations(), 0);
}

#[test]
fn test_reply_error_stops_context_with_partial_count() {
    init_tracing();
    let fabric = LoopbackFabric::new(LoopbackOptions {
        faults: FaultPlan {
            fail_recv_after: Some(25),
            ..Default::default()
        },
        ..Default::default()
    });
    let mut cfg = config(1, 100);
    cfg.reply_wait = true;

    let report = Driver::new(cfg, Arc::new(fabric.clone())).unwrap().run();
    let c = &report.contexts[0];
    assert_eq!(c.completed, 25);
    assert!(c.completed < c.requested);
    assert_eq!(c.stop_reason, StopReason::RuntimeFailed);
    assert_eq!(c.state, ContextState::Done);
    assert!(c.error.as_deref().unwrap().contains("reply to"));
    assert_eq!(report.stopped_early, 1);
    assert!(report.has_failures());
    assert_eq!(fabric.active_registrations(), 0);
}

#[test]
fn test_refused_connections_do_not_stop_siblings() {
    init_tracing();
    let fabric = LoopbackFabric::new(LoopbackOptions {
        faults: FaultPlan {
            refuse_after: Some(2),
            ..Default::default()
        },
        ..Default::default()
    });

    let report = Driver::new(config(4, 300), Arc::new(fabric.clone()))
        .unwrap()
        .run();

    let failed: Vec<_> = report
        .contexts
        .iter()
        .filter(|c| c.stop_reason == StopReason::SetupFailed)
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|c| c.completed == 0 && c.state == ContextState::Done));
    assert_eq!(report.complete_contexts, 2);
    assert_eq!(report.total_requests, 600);
    assert_eq!(fabric.refused(), 2);
    assert_eq!(fabric.active_registrations(), 0);
}

#[test]
fn test_zero_duration_bound_stops_before_sending() {
    init_tracing();
    let fabric = LoopbackFabric::default();
    let mut cfg = config(2, 1000);
    cfg.run_duration = Duration::ZERO;

    let report = Driver::new(cfg, Arc::new(fabric.clone())).unwrap().run();
    assert!(report
        .contexts
        .iter()
        .all(|c| c.stop_reason == StopReason::DurationElapsed && c.completed == 0));
    assert!(!report.has_failures());
    assert_eq!(fabric.requests_received(), 0);
    assert_eq!(fabric.active_registrations(), 0);
}

#[test]
fn test_config_error_is_raised_before_any_connection() {
    init_tracing();
    let fabric = LoopbackFabric::default();
    let mut cfg = config(4, 10);
    cfg.protocol = Encoding::Binary;
    cfg.request_size = 24;
    cfg.commands = vec![Command::Delete];

    let err = Driver::new(cfg, Arc::new(fabric.clone())).err().unwrap();
    match err {
        BenchError::Config(ConfigError::RequestTooSmall {
            command, minimum, ..
        }) => {
            assert_eq!(command, Command::Delete);
            assert_eq!(minimum, 25);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fabric.connections(), 0);
}

#[test]
fn test_long_silent_binary_run_keeps_receive_capacity() {
    init_tracing();
    let fabric = LoopbackFabric::default();
    let mut cfg = config(2, 2000);
    cfg.protocol = Encoding::Binary;
    cfg.transport.recv_slots = 4;

    // incr and decr carry a value, so the endpoint rejects both of them in
    // every cycle of eight, far more often than there are receive slots
    let report = Driver::new(cfg, Arc::new(fabric.clone())).unwrap().run();
    for c in &report.contexts {
        assert_eq!(c.stop_reason, StopReason::Completed, "{:?}", c.error);
        assert_eq!(c.completed, 2000);
        assert_eq!(c.replies, 500);
    }
    assert_eq!(fabric.replies_sent(), 1000);
    assert_eq!(fabric.active_registrations(), 0);
}

#[test]
fn test_silent_rejections_leave_every_slot_posted() {
    init_tracing();
    let fabric = LoopbackFabric::default();
    let mut cfg = config(1, 0);
    cfg.protocol = Encoding::Binary;
    cfg.transport.recv_slots = 2;
    let table = TemplateTable::build(&cfg).unwrap();

    let mut conn = Connection::open(&fabric, &cfg, 0).unwrap();
    for i in 0..64 {
        conn.send_request(table.for_iteration(i)).unwrap();
        conn.collect_replies(|_| {}).unwrap();
        assert_eq!(conn.outstanding(), 2);
    }
    let summary = conn.close();
    assert_eq!(summary.failures, 0);
    assert_eq!(fabric.replies_sent(), 16);
    assert_eq!(fabric.active_registrations(), 0);
}

#[test]
fn test_command_subset_cycles_only_chosen_commands() {
    init_tracing();
    let fabric = LoopbackFabric::default();
    let mut cfg = config(1, 10);
    cfg.commands = vec![Command::Set, Command::Delete];
    cfg.protocol = Encoding::Binary;
    // too small for incr/decr, fine for set and delete
    cfg.request_size = 40;
    cfg.reply_wait = true;

    let driver = Driver::new(cfg, Arc::new(fabric.clone())).unwrap();
    assert_eq!(driver.templates().len(), 2);
    let report = driver.run();
    assert_eq!(report.total_replies, 10);
    assert_eq!(fabric.active_registrations(), 0);
}

#[test]
fn test_json_config_file_drives_a_run() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("mc-bench-config-{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{
            "threads": 2,
            "requests_per_thread": 40,
            "protocol": "binary",
            "request_size": 64,
            "reply_wait": true,
            "commands": ["set", "incr", "delete"],
            "transport": { "recv_slots": 4 }
        }"#,
    )
    .unwrap();

    let cfg = BenchConfig::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(cfg.server_port, "11211");
    assert_eq!(cfg.transport.recv_slots, 4);

    let fabric = LoopbackFabric::default();
    let report = Driver::new(cfg, Arc::new(fabric.clone())).unwrap().run();
    assert_eq!(report.encoding, Encoding::Binary);
    assert_eq!(report.total_requests, 80);
    assert_eq!(report.total_replies, 80);
    assert_eq!(fabric.active_registrations(), 0);
}

#[tokio::test]
async fn test_stop_handle_interrupts_running_contexts() {
    init_tracing();
    let fabric = LoopbackFabric::default();
    let driver = Arc::new(Driver::new(config(2, u64::MAX), Arc::new(fabric.clone())).unwrap());
    let stop = driver.stop_handle();

    let runner = Arc::clone(&driver);
    let run = tokio::task::spawn_blocking(move || runner.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.stop();
    let report = run.await.unwrap();

    assert!(report
        .contexts
        .iter()
        .all(|c| c.stop_reason == StopReason::Interrupted && c.completed < c.requested));
    assert_eq!(report.stopped_early, 2);
    assert!(!report.has_failures());
    assert_eq!(fabric.active_registrations(), 0);
}
