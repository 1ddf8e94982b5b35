//! Full-duplex relay between two established connections

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Relay bytes between `local` and `remote` until both directions drain.
///
/// Remote-to-local copying runs on a spawned task while local-to-remote runs
/// on the caller. When a direction reaches end-of-stream its destination's
/// write side is shut down so the peer observes the close. Errors in either
/// direction are logged and never returned: the outcome of a relay is
/// observed through the connections' own close signals.
pub async fn relay<L, R>(local: L, remote: R)
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let remote_to_local = tokio::spawn(async move {
        let result = tokio::io::copy(&mut remote_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
        result
    });

    match tokio::io::copy(&mut local_read, &mut remote_write).await {
        Ok(n) => debug!("Relay local -> remote finished ({} bytes)", n),
        Err(e) => warn!("Relay failed: local -> remote: {}", e),
    }
    let _ = remote_write.shutdown().await;

    match remote_to_local.await {
        Ok(Ok(n)) => debug!("Relay remote -> local finished ({} bytes)", n),
        Ok(Err(e)) => warn!("Relay failed: remote -> local: {}", e),
        Err(e) => warn!("Relay failed: remote -> local task: {}", e),
    }
}
