use std::net::TcpListener;

use tracing::debug;

/// Picks a free TCP port for the console bridge.
///
/// The listener is released before returning, so another process may grab the
/// port before the bridge binds it. That window is accepted.
pub fn allocate() -> std::io::Result<u16> {
    debug!("Looking for an available port for the console bridge");
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
