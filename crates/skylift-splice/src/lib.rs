//! Full-duplex byte splice with half-close propagation
//!
//! Couples two byte streams so that each side's output becomes the other
//! side's input. When one direction observes EOF, the write side of the
//! opposite stream is shut down so the peer sees end-of-request and can
//! still respond on the other direction. The splice only returns once both
//! directions have completed, and both streams are closed on return.
//!
//! The half-close capability is `AsyncWrite::poll_shutdown`: plain TCP maps
//! it to a write-side shutdown, TLS wrappers send close_notify through the
//! record layer, and SSH channel streams signal EOF on the channel. That
//! makes the splice uniform over every endpoint kind it is used with.

use tokio::io::{copy, split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes in both directions between `a` and `b` until both sides have
/// finished, propagating half-closes.
///
/// Returns the number of bytes moved `(a_to_b, b_to_a)`. Errors in one
/// direction are logged once and end that direction without masking the
/// other; a torn-down socket on one side surfaces as EOF or an error on the
/// other shortly after.
pub async fn splice<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = split(a);
    let (mut b_read, mut b_write) = split(b);

    let a_to_b = async {
        let n = match copy(&mut a_read, &mut b_write).await {
            Ok(n) => n,
            Err(e) => {
                debug!("splice a->b ended with error: {}", e);
                0
            }
        };
        // EOF (or failure) from a: half-close b so it sees end-of-input.
        let _ = b_write.shutdown().await;
        n
    };

    let b_to_a = async {
        let n = match copy(&mut b_read, &mut a_write).await {
            Ok(n) => n,
            Err(e) => {
                debug!("splice b->a ended with error: {}", e);
                0
            }
        };
        let _ = a_write.shutdown().await;
        n
    };

    tokio::join!(a_to_b, b_to_a)
}
