//! Link lifecycle and deadline behavior of the daemon.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{connect, expect_eof, recv, send, TestEnv, GOOD_ARCHIVE};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use updraft_core::ipc::InstallerMessageId;
use updraft_installer::DaemonExit;

#[tokio::test(flavor = "multi_thread")]
async fn second_updater_connection_is_rejected() {
    let env = TestEnv::new();
    let daemon = env.spawn_daemon();

    let agent = connect(&env.agent_socket).await;
    let mut first = connect(&env.updater_socket).await;

    // The second connection is dropped immediately.
    let mut second = UnixStream::connect(&env.updater_socket).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .expect("second connection should be closed promptly")
        .unwrap();
    assert_eq!(read, 0);

    // The first link proceeds undisturbed.
    let payload = env.installation_input(GOOD_ARCHIVE).encode().unwrap();
    send(
        &mut first,
        InstallerMessageId::InstallationData as i32,
        Bytes::from(payload),
    )
    .await;
    let started = recv(&mut first).await;
    assert_eq!(started.id, InstallerMessageId::ExtractionStarted as i32);

    // Tear the first link down before installation begins: fatal.
    drop(first);
    drop(agent);
    assert_eq!(daemon.await.unwrap(), DaemonExit::Failure);
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_deadline_without_peers_is_fatal() {
    let mut env = TestEnv::new();
    env.config.timeouts.first_message = Duration::from_millis(300);
    let daemon = env.spawn_daemon();

    let exit = tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon should exit on the startup deadline")
        .unwrap();
    assert_eq!(exit, DaemonExit::Failure);

    // The staging directory was never communicated, so it is untouched;
    // the daemon's own transient artifacts are gone.
    assert!(env.staging.exists());
    assert!(!env.own_bundle.exists());
    assert!(!env.updater_socket.exists());
    assert!(!env.agent_socket.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_deadline_without_agent_is_fatal() {
    let mut env = TestEnv::new();
    env.config.timeouts.first_message = Duration::from_millis(400);
    let daemon = env.spawn_daemon();

    // Input arrives but the agent never connects.
    let mut updater = connect(&env.updater_socket).await;
    let payload = env.installation_input(GOOD_ARCHIVE).encode().unwrap();
    send(
        &mut updater,
        InstallerMessageId::InstallationData as i32,
        Bytes::from(payload),
    )
    .await;

    let exit = tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon should exit on the startup deadline")
        .unwrap();
    assert_eq!(exit, DaemonExit::Failure);
}

#[tokio::test(flavor = "multi_thread")]
async fn updater_drop_before_installation_is_fatal() {
    let env = TestEnv::new();
    let daemon = env.spawn_daemon();

    let mut agent = connect(&env.agent_socket).await;
    let updater = connect(&env.updater_socket).await;
    drop(updater);

    let exit = tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon should exit when the updater vanishes")
        .unwrap();
    assert_eq!(exit, DaemonExit::Failure);
    expect_eof(&mut agent).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_drop_before_installation_is_fatal() {
    let env = TestEnv::new();
    let daemon = env.spawn_daemon();

    let mut updater = connect(&env.updater_socket).await;
    let agent = connect(&env.agent_socket).await;
    drop(agent);

    let exit = tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon should exit when the agent vanishes")
        .unwrap();
    assert_eq!(exit, DaemonExit::Failure);
    expect_eof(&mut updater).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_host_identifier_is_fatal() {
    let env = TestEnv::new();
    let daemon = env.spawn_daemon();

    let mut agent = connect(&env.agent_socket).await;
    let mut updater = connect(&env.updater_socket).await;

    // Point the input at a bundle whose identifier differs.
    let other = env.dir.path().join("apps/Other");
    std::fs::create_dir_all(&other).unwrap();
    std::fs::write(
        other.join("Info.toml"),
        "identifier = \"com.example.Other\"\nversion = \"1.0\"\n",
    )
    .unwrap();
    let mut input = env.installation_input(GOOD_ARCHIVE);
    input.host_bundle_path = other;
    send(
        &mut updater,
        InstallerMessageId::InstallationData as i32,
        Bytes::from(input.encode().unwrap()),
    )
    .await;

    assert_eq!(daemon.await.unwrap(), DaemonExit::Failure);
    expect_eof(&mut updater).await;
    expect_eof(&mut agent).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_relaunch_path_is_fatal() {
    let env = TestEnv::new();
    let daemon = env.spawn_daemon();

    let mut agent = connect(&env.agent_socket).await;
    let mut updater = connect(&env.updater_socket).await;

    let mut input = env.installation_input(GOOD_ARCHIVE);
    input.relaunch_path = None;
    send(
        &mut updater,
        InstallerMessageId::InstallationData as i32,
        Bytes::from(input.encode().unwrap()),
    )
    .await;

    assert_eq!(daemon.await.unwrap(), DaemonExit::Failure);
    expect_eof(&mut updater).await;
    expect_eof(&mut agent).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_message_identifier_is_fatal() {
    let env = TestEnv::new();
    let daemon = env.spawn_daemon();

    let mut agent = connect(&env.agent_socket).await;
    let mut updater = connect(&env.updater_socket).await;

    send(&mut updater, 999, Bytes::new()).await;

    assert_eq!(daemon.await.unwrap(), DaemonExit::Failure);
    expect_eof(&mut updater).await;
    expect_eof(&mut agent).await;
}
