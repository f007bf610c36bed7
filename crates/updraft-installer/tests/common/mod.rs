//! Shared harness for daemon integration tests.
//!
//! Builds a disposable on-disk world (host bundle, staging directory with
//! a signed archive, the daemon's own transient bundle), spawns the
//! daemon with shortened deadlines, and provides framed fake peers for
//! the updater and agent sockets.

#![allow(dead_code)] // Not every test binary uses every helper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use updraft_core::archive::{ExtractError, Unarchiver};
use updraft_core::codesign::StaticCodeSignatureCheck;
use updraft_core::ipc::messages::encode_process_id;
use updraft_core::ipc::{AgentMessageId, InstallationInput, Message, MessageCodec};
use updraft_installer::installer::default_installer_factory;
use updraft_installer::links::{agent_socket_path, updater_socket_path};
use updraft_installer::{Collaborators, DaemonConfig, DaemonExit, Timeouts};

/// Identifier every test host bundle carries.
pub const IDENTIFIER: &str = "com.example.Notepad";

/// Name of the well-formed archive in the staging directory.
pub const GOOD_ARCHIVE: &str = "update.tar.gz";

/// Name of the archive the scripted unarchiver refuses to extract.
pub const CORRUPT_ARCHIVE: &str = "corrupt.tar.gz";

/// Deterministic signing key for the host and update bundles.
pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[17u8; 32])
}

/// A signing key unrelated to any bundle.
pub fn stray_key() -> SigningKey {
    SigningKey::from_bytes(&[99u8; 32])
}

/// Scripted unarchiver: "extracts" by copying a prepared bundle template
/// into the destination, reporting progress 0.5 on the way.
struct ScriptedUnarchiver {
    template: PathBuf,
    fail: bool,
}

impl Unarchiver for ScriptedUnarchiver {
    fn unpack(
        &self,
        destination: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), ExtractError> {
        if self.fail {
            return Err(ExtractError::Malformed("scripted failure".into()));
        }
        progress(0.5);
        let name = self.template.file_name().unwrap();
        copy_dir(&self.template, &destination.join(name)).map_err(|source| ExtractError::Io {
            path: destination.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// The disposable world one test runs in.
pub struct TestEnv {
    pub dir: TempDir,
    pub host: PathBuf,
    pub staging: PathBuf,
    pub own_bundle: PathBuf,
    pub updater_socket: PathBuf,
    pub agent_socket: PathBuf,
    pub signature: String,
    pub config: DaemonConfig,
    pub collaborators: Collaborators,
}

fn write_bundle(path: &Path, version: &str, key: Option<&SigningKey>) {
    std::fs::create_dir_all(path).unwrap();
    let mut manifest = format!("identifier = \"{IDENTIFIER}\"\nversion = \"{version}\"\n");
    if let Some(key) = key {
        manifest.push_str(&format!(
            "public_key = \"{}\"\n",
            BASE64_STANDARD.encode(key.verifying_key().to_bytes())
        ));
    }
    std::fs::write(path.join("Info.toml"), manifest).unwrap();
}

/// Deadlines shortened for tests; the exit delay stays observable.
pub fn test_timeouts() -> Timeouts {
    Timeouts {
        first_message: Duration::from_secs(5),
        pid_retrieval: Duration::from_secs(5),
        progress_deferral: Duration::from_millis(250),
        exit_delay: Duration::from_millis(400),
    }
}

impl TestEnv {
    /// Build the standard world: host and update bundles share a key.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let key = signing_key();

        let host = dir.path().join("apps/Example");
        write_bundle(&host, "1.0", Some(&key));

        let template = dir.path().join("template/Example");
        write_bundle(&template, "2.0", Some(&key));
        std::fs::write(template.join("binary"), b"v2").unwrap();

        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let archive_bytes = b"archive-bytes-v2".to_vec();
        std::fs::write(staging.join(GOOD_ARCHIVE), &archive_bytes).unwrap();
        std::fs::write(staging.join(CORRUPT_ARCHIVE), b"garbage").unwrap();
        let signature = BASE64_STANDARD.encode(key.sign(&archive_bytes).to_bytes());

        let own_bundle = dir.path().join("Installer");
        std::fs::create_dir_all(&own_bundle).unwrap();
        std::fs::write(own_bundle.join("updraft-installer"), b"#!").unwrap();

        let socket_dir = dir.path().join("sockets");
        let config = DaemonConfig {
            host_bundle_identifier: IDENTIFIER.to_string(),
            allow_interaction: false,
            socket_dir: socket_dir.clone(),
            own_bundle_path: Some(own_bundle.clone()),
            timeouts: test_timeouts(),
        };

        let collaborators = Collaborators {
            unarchiver: Arc::new(move |archive: &Path, _password: Option<&str>| {
                let fail = archive
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().contains("corrupt"));
                Some(Box::new(ScriptedUnarchiver {
                    template: template.clone(),
                    fail,
                }) as Box<dyn Unarchiver>)
            }),
            installer: default_installer_factory(),
            codesign: Arc::new(StaticCodeSignatureCheck::unsigned()),
        };

        Self {
            updater_socket: updater_socket_path(&socket_dir, IDENTIFIER),
            agent_socket: agent_socket_path(&socket_dir, IDENTIFIER),
            dir,
            host,
            staging,
            own_bundle,
            signature,
            config,
            collaborators,
        }
    }

    /// Spawn the daemon under test.
    pub fn spawn_daemon(&self) -> tokio::task::JoinHandle<DaemonExit> {
        let config = self.config.clone();
        let collaborators = self.collaborators.clone();
        tokio::spawn(updraft_installer::run_daemon(config, collaborators))
    }

    /// Installation input pointing at an archive in the staging directory.
    pub fn installation_input(&self, archive_name: &str) -> InstallationInput {
        InstallationInput {
            host_bundle_path: self.host.clone(),
            staging_directory: self.staging.clone(),
            archive_file_name: archive_name.to_string(),
            decryption_password: None,
            signature: self.signature.clone(),
            relaunch_path: Some(self.host.clone()),
        }
    }
}

/// A framed fake peer.
pub type Peer = Framed<UnixStream, MessageCodec>;

/// Connect to a daemon socket, retrying while the daemon binds it.
pub async fn connect(path: &Path) -> Peer {
    for _ in 0..200 {
        if let Ok(stream) = UnixStream::connect(path).await {
            return Framed::new(stream, MessageCodec::new());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon socket {} never appeared", path.display());
}

/// Send one message.
pub async fn send(peer: &mut Peer, id: i32, payload: Bytes) {
    peer.send(Message::new(id, payload)).await.unwrap();
}

/// Receive one message, with a generous timeout.
pub async fn recv(peer: &mut Peer) -> Message {
    tokio::time::timeout(Duration::from_secs(10), peer.next())
        .await
        .expect("timed out waiting for a message")
        .expect("peer closed unexpectedly")
        .expect("protocol error")
}

/// Assert the peer sees a clean end of stream.
pub async fn expect_eof(peer: &mut Peer) {
    let frame = tokio::time::timeout(Duration::from_secs(10), peer.next())
        .await
        .expect("timed out waiting for EOF");
    assert!(frame.is_none(), "expected EOF, got {frame:?}");
}

/// Reply to the agent-side PID registration with a live process id.
pub async fn reply_pid(agent: &mut Peer, pid: i32) {
    send(
        agent,
        AgentMessageId::RelaunchProcessId as i32,
        encode_process_id(pid),
    )
    .await;
}

/// A stand-in host process the daemon watches for termination.
pub struct FakeHost {
    child: std::process::Child,
}

impl FakeHost {
    /// Spawn a long-sleeping child.
    pub fn spawn() -> Self {
        let child = std::process::Command::new("sleep")
            .arg("600")
            .spawn()
            .unwrap();
        Self { child }
    }

    /// The child's process id.
    #[allow(clippy::cast_possible_wrap)]
    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Kill and reap the child so liveness probes see it disappear.
    pub fn terminate(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
