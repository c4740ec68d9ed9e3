// tests/supervisor.rs
mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use tcp_relay::{RelayConfig, RelayError, RelayExit, RelayState, Supervisor};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_stop_and_relaunch() {
    let (remote, accepted) = echo_server().await;
    let cfg = RelayConfig::new(0, "127.0.0.1", remote.port());
    let mut supervisor = Supervisor::default();
    supervisor.add(cfg.clone());

    supervisor.start_all().await.unwrap();
    let engine = supervisor.get(&cfg).unwrap().engine().clone();
    wait_until("first run", || engine.state() == RelayState::Running).await;

    let relay = supervisor.add(cfg.clone());
    relay.stop();
    assert!(matches!(within(relay.join()).await, Some(RelayExit::Stopped)));
    assert!(relay.join().await.is_none(), "worker already reaped");

    // relaunch clears the previous run's manual-stop flag
    relay.launch().await.unwrap();
    wait_until("second run", || engine.state() == RelayState::Running).await;
    assert!(!engine.is_manual_stop());
    wait_until("second probe", || accepted.load(Ordering::SeqCst) == 2).await;

    // launching a running relay is a no-op
    relay.launch().await.unwrap();
    assert_eq!(engine.state(), RelayState::Running);

    let exits = within(supervisor.shutdown()).await;
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].0, cfg);
    assert!(!exits[0].1.is_failure());
    assert!(supervisor.failed().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_probe_is_reported_as_failure() {
    let (remote, _) = echo_server().await;
    let good = RelayConfig::new(0, "127.0.0.1", remote.port());
    let bad = RelayConfig::new(0, "127.0.0.1", closed_port());
    let mut supervisor = Supervisor::new(Duration::from_secs(2));
    supervisor.add(good.clone());
    supervisor.add(bad.clone());
    supervisor.start_all().await.unwrap();

    let bad_engine = supervisor.get(&bad).unwrap().engine().clone();
    wait_until("bad relay to stop", || bad_engine.state() == RelayState::Stopped).await;
    let good_engine = supervisor.get(&good).unwrap().engine().clone();
    wait_until("good relay to run", || good_engine.state() == RelayState::Running).await;
    assert_eq!(supervisor.failed(), vec![bad.clone()]);

    let exits = within(supervisor.shutdown()).await;
    assert_eq!(exits.len(), 2);
    for (cfg, exit) in &exits {
        if *cfg == bad {
            match exit {
                RelayExit::Failed(RelayError::Probe(cause)) => assert!(!cause.is_timeout()),
                other => panic!("expected probe failure, got {other:?}"),
            }
        } else {
            assert!(matches!(exit, RelayExit::Stopped), "got {exit:?}");
        }
    }
    // shutdown did not relabel the failed relay as stopped
    assert!(!bad_engine.is_manual_stop());
}

#[tokio::test]
async fn adding_same_mapping_twice_keeps_one_relay() {
    let mut supervisor = Supervisor::default();
    assert!(supervisor.is_empty());
    supervisor.add(RelayConfig::new(9005, "10.0.0.2", 9004));
    supervisor.add(RelayConfig::new(9005, "10.0.0.2", 9004));
    supervisor.add(RelayConfig::new(9006, "10.0.0.2", 9004));
    assert_eq!(supervisor.len(), 2);
    let named = RelayConfig::new(9006, "10.0.0.2", 9004).with_description("reporting db");
    supervisor.add(named.clone());
    supervisor.add(named.clone());
    assert_eq!(supervisor.len(), 3);
    let row = serde_json::to_value(supervisor.get(&named).unwrap().status()).unwrap();
    assert_eq!(row["desc"], "reporting db");
    assert!(supervisor.get(&RelayConfig::new(9007, "10.0.0.2", 9004)).is_none());

    let statuses = supervisor.status();
    assert!(statuses.iter().all(|s| s.state == RelayState::Init && !s.manual_stop));
    // nothing was launched, so there is nothing to reap
    assert!(supervisor.shutdown().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_serializes_for_management_layer() {
    let (remote, _) = echo_server().await;
    let cfg = RelayConfig::new(0, "127.0.0.1", remote.port());
    let mut supervisor = Supervisor::default();
    supervisor.add(cfg.clone());
    supervisor.start_all().await.unwrap();
    let engine = supervisor.get(&cfg).unwrap().engine().clone();
    wait_until("relay to run", || engine.state() == RelayState::Running).await;

    let status = supervisor.get(&cfg).unwrap().status();
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["localPort"], 0);
    assert_eq!(json["remoteHost"], "127.0.0.1");
    assert_eq!(json["remotePort"], remote.port());
    assert_eq!(json["state"], "RUNNING");
    assert_eq!(json["manualStop"], false);
    assert_eq!(json["stats"]["accepted"], 0);

    supervisor.stop_all();
    let status = serde_json::to_value(supervisor.get(&cfg).unwrap().status()).unwrap();
    assert_eq!(status["state"], "STOPPED");
    assert_eq!(status["manualStop"], true);
    within(supervisor.shutdown()).await;
}
