//! Socket servers for the two peer links.
//!
//! Both links are Unix-socket servers named deterministically from the
//! host bundle identifier. Each services exactly one connection for the
//! daemon's lifetime; later connection attempts are accepted and
//! immediately dropped so the active peer is never disturbed.
//!
//! Inbound frames and lifecycle transitions are forwarded into the
//! controller's event funnel; outbound messages are queued on the link
//! handle and written by a dedicated writer half.

mod server;

use std::path::{Path, PathBuf};

pub use server::{bind_link_socket, spawn_link_server, LinkHandle};

/// Socket name of the updater endpoint for a host bundle identifier.
#[must_use]
pub fn updater_socket_path(socket_dir: &Path, identifier: &str) -> PathBuf {
    socket_dir.join(format!("{identifier}.installer.sock"))
}

/// Socket name of the agent endpoint for a host bundle identifier.
#[must_use]
pub fn agent_socket_path(socket_dir: &Path, identifier: &str) -> PathBuf {
    socket_dir.join(format!("{identifier}.agent.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_names_derive_from_identifier() {
        let dir = Path::new("/run/updraft");
        assert_eq!(
            updater_socket_path(dir, "com.example.App"),
            Path::new("/run/updraft/com.example.App.installer.sock")
        );
        assert_eq!(
            agent_socket_path(dir, "com.example.App"),
            Path::new("/run/updraft/com.example.App.agent.sock")
        );
    }
}
