//! Async handshake drivers.
//!
//! Wraps the [`ServerHandshake`]/[`ClientHandshake`] state machines around a
//! line-framed stream. Both the accept loop and outbound ring connections
//! (and the console client) go through here before any command is read.

use futures::{SinkExt, StreamExt};
use mpd_core::wire::{MAX_LINE_LENGTH, reply};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use super::error::{HANDSHAKE_TIMEOUT, ProtocolError, ProtocolResult};
use super::handshake::{ClientHandshake, ConnectionType, ServerHandshake};

/// A stream framed into newline-terminated lines.
pub type LineFramed<S> = Framed<S, LinesCodec>;

/// Frames `io` with the protocol's maximum line length.
#[must_use]
pub fn framed<S>(io: S) -> LineFramed<S>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

/// Result of the accepting side of a handshake.
#[derive(Debug)]
pub enum HandshakeResult {
    /// Handshake succeeded; the peer announced this connection type.
    Success(ConnectionType),
    /// Handshake failed (wrong digest or bad type line); `FAIL` was sent
    /// where appropriate and the connection should be closed.
    Failed,
    /// Connection was closed before the handshake completed.
    ConnectionClosed,
}

/// Reads one line, bounded by [`HANDSHAKE_TIMEOUT`]. `None` means EOF.
async fn next_line<S>(framed: &mut LineFramed<S>) -> ProtocolResult<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(line))) => Ok(Some(line)),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(None) => Ok(None),
        Err(_) => Err(ProtocolError::timeout(HANDSHAKE_TIMEOUT)),
    }
}

/// Reads one line or fails with [`ProtocolError::ConnectionClosed`].
///
/// # Errors
///
/// Returns an error on EOF, timeout, oversized line or I/O failure.
pub async fn expect_line<S>(framed: &mut LineFramed<S>) -> ProtocolResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    next_line(framed).await?.ok_or(ProtocolError::ConnectionClosed)
}

/// Runs the accepting side: challenge, verify, read connection type.
///
/// # Errors
///
/// Returns an error for I/O failures and timeouts. Authentication failures
/// are reported as [`HandshakeResult::Failed`].
pub async fn accept_handshake<S>(
    framed: &mut LineFramed<S>,
    phrase: &str,
) -> ProtocolResult<HandshakeResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = ServerHandshake::new(phrase);
    framed.send(handshake.challenge()).await?;

    let Some(response) = next_line(framed).await? else {
        return Ok(HandshakeResult::ConnectionClosed);
    };
    let verdict = handshake.process_response(&response)?;
    framed.send(verdict).await?;
    if verdict != reply::SUCCESS {
        warn!("peer failed authentication");
        return Ok(HandshakeResult::Failed);
    }

    let Some(type_line) = next_line(framed).await? else {
        return Ok(HandshakeResult::ConnectionClosed);
    };
    match handshake.process_type(&type_line) {
        Ok(connection_type) => {
            debug!(%connection_type, "handshake completed");
            Ok(HandshakeResult::Success(connection_type))
        },
        Err(e) => {
            warn!(error = %e, "bad connection type");
            Ok(HandshakeResult::Failed)
        },
    }
}

/// Runs the connecting side: answer challenge, check verdict, announce type.
///
/// # Errors
///
/// Returns [`ProtocolError::AuthenticationFailed`] if the acceptor rejected
/// our digest, or an I/O, timeout or closed-connection error.
pub async fn connect_handshake<S>(
    framed: &mut LineFramed<S>,
    phrase: &str,
    connection_type: ConnectionType,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = ClientHandshake::new(phrase, connection_type);
    let challenge = expect_line(framed).await?;
    let digest = handshake.respond(&challenge)?;
    framed.send(digest).await?;

    let verdict = expect_line(framed).await?;
    let type_line = handshake.process_verdict(&verdict)?;
    framed.send(type_line).await?;
    Ok(())
}

/// Opens a TCP connection to `addr` and authenticates as `connection_type`.
///
/// # Errors
///
/// Returns an error if the connection or the handshake fails.
pub async fn connect(
    addr: &str,
    phrase: &str,
    connection_type: ConnectionType,
) -> ProtocolResult<LineFramed<TcpStream>> {
    let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::timeout(HANDSHAKE_TIMEOUT))??;
    stream.set_nodelay(true)?;
    let mut framed = framed(stream);
    connect_handshake(&mut framed, phrase, connection_type).await?;
    Ok(framed)
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (a, b) = duplex(4096);
        let mut server = framed(a);
        let mut client = framed(b);

        let accept = tokio::spawn(async move { accept_handshake(&mut server, "behappy").await });
        connect_handshake(&mut client, "behappy", ConnectionType::Left("n2".into()))
            .await
            .unwrap();

        match accept.await.unwrap().unwrap() {
            HandshakeResult::Success(ConnectionType::Left(host)) => assert_eq!(host, "n2"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_phrase_is_rejected() {
        let (a, b) = duplex(4096);
        let mut server = framed(a);
        let mut client = framed(b);

        let accept = tokio::spawn(async move { accept_handshake(&mut server, "behappy").await });
        let result = connect_handshake(&mut client, "wrong", ConnectionType::Console).await;
        assert!(matches!(result, Err(ProtocolError::AuthenticationFailed)));
        assert!(matches!(
            accept.await.unwrap().unwrap(),
            HandshakeResult::Failed
        ));
    }

    #[tokio::test]
    async fn test_peer_hangs_up_mid_handshake() {
        let (a, b) = duplex(4096);
        let mut server = framed(a);
        let accept = tokio::spawn(async move { accept_handshake(&mut server, "behappy").await });
        drop(b);
        assert!(matches!(
            accept.await.unwrap(),
            Ok(HandshakeResult::ConnectionClosed) | Err(_)
        ));
    }
}
