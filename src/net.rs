//! Local network helpers

use tokio::net::TcpListener;

/// Ask the OS for a free local port by binding an ephemeral listener and
/// closing it immediately.
///
/// Inherently racy: the port can be re-taken before the caller binds it.
/// Loss is rare and surfaces as a tunnel-establishment failure, not
/// silent corruption.
pub async fn free_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
