// SOCKS5 CONNECT handshake (RFC 1928), client side only.
//
// Hostname addressing is mandatory here: onion addresses must reach the
// proxy unresolved, so ATYP is always DOMAINNAME.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V4: u8 = 0x01;
const ATYP_V6: u8 = 0x04;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("proxy offered no acceptable auth method")]
    NoAuthMethod,
    #[error("proxy refused connect (reply code {0})")]
    Refused(u8),
    #[error("malformed proxy reply")]
    Malformed,
    #[error("hostname longer than 255 bytes")]
    HostTooLong,
}

/// Negotiate a CONNECT tunnel to `host:port` over an established stream
/// to the proxy. On success the stream carries the tunneled connection.
pub(crate) async fn connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if host.len() > 255 {
        return Err(SocksError::HostTooLong);
    }

    // Greeting: no authentication
    stream.write_all(&[VERSION, 1, METHOD_NONE]).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(SocksError::Malformed);
    }
    if choice[1] != METHOD_NONE {
        return Err(SocksError::NoAuthMethod);
    }

    // CONNECT request with domain addressing
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(SocksError::Malformed);
    }
    if head[1] != 0x00 {
        return Err(SocksError::Refused(head[1]));
    }

    // Drain the bound address, whatever its type
    let addr_len = match head[3] {
        ATYP_V4 => 4,
        ATYP_V6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(SocksError::Malformed),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    async fn fake_proxy(mut stream: DuplexStream, reply_code: u8) {
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        stream.write_all(&[0x05, 0x00]).await.unwrap();

        let mut head = [0u8; 5];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
        let mut rest = vec![0u8; head[4] as usize + 2];
        stream.read_exact(&mut rest).await.unwrap();

        // Reply with an IPv4 bound address
        stream
            .write_all(&[0x05, reply_code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_success() {
        let (mut client, proxy) = tokio::io::duplex(1024);
        let server = tokio::spawn(fake_proxy(proxy, 0x00));

        connect(&mut client, "abcdef.onion", 443).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (mut client, proxy) = tokio::io::duplex(1024);
        tokio::spawn(fake_proxy(proxy, 0x05));

        let result = connect(&mut client, "abcdef.onion", 443).await;
        assert!(matches!(result, Err(SocksError::Refused(0x05))));
    }

    #[tokio::test]
    async fn test_rejects_oversized_hostname() {
        let (mut client, _proxy) = tokio::io::duplex(1024);
        let long_host = "a".repeat(300);
        let result = connect(&mut client, &long_host, 443).await;
        assert!(matches!(result, Err(SocksError::HostTooLong)));
    }
}
