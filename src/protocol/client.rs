use super::types::*;
use crate::utils::error::{Result, SpeedtestError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Send the method-selection greeting and complete authentication.
///
/// Offers `NoAuth`, plus `UserPass` when credentials are supplied, and runs
/// the RFC 1929 sub-negotiation if the server picks it.
pub async fn negotiate<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<AuthMethod>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS_VERSION, 0x02, AuthMethod::NoAuth as u8, AuthMethod::UserPass as u8]
    } else {
        &[SOCKS_VERSION, 0x01, AuthMethod::NoAuth as u8]
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(SpeedtestError::Protocol(format!(
            "Unexpected SOCKS version in method reply: 0x{:02x}",
            choice[0]
        )));
    }

    let method = AuthMethod::from(choice[1]);
    trace!(?method, "Server selected auth method");

    match (method, credentials) {
        (AuthMethod::NoAuth, _) => Ok(method),
        (AuthMethod::UserPass, Some(creds)) => {
            send_userpass(stream, creds).await?;
            Ok(method)
        }
        (AuthMethod::UserPass, None) => Err(SpeedtestError::AuthFailed(
            "server requires username/password".to_string(),
        )),
        (AuthMethod::NoAcceptable, _) => Err(SpeedtestError::AuthFailed(
            "no acceptable authentication method".to_string(),
        )),
    }
}

async fn send_userpass<S>(stream: &mut S, creds: &Credentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = creds.username.as_bytes();
    let pass = creds.password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(SpeedtestError::AuthFailed(
            "username or password longer than 255 bytes".to_string(),
        ));
    }

    let mut buf = Vec::with_capacity(3 + user.len() + pass.len());
    buf.push(USERPASS_VERSION);
    buf.push(user.len() as u8);
    buf.extend_from_slice(user);
    buf.push(pass.len() as u8);
    buf.extend_from_slice(pass);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(SpeedtestError::AuthFailed(format!(
            "server rejected credentials (status 0x{:02x})",
            reply[1]
        )));
    }
    Ok(())
}

/// Issue a request and return the bound address from the reply.
pub async fn request<S>(
    stream: &mut S,
    command: Command,
    address: &Address,
    port: u16,
) -> Result<(Address, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![SOCKS_VERSION, command as u8, 0x00];
    write_address(&mut buf, address)?;
    buf.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SpeedtestError::Protocol(format!(
            "Unexpected SOCKS version in reply: 0x{:02x}",
            head[0]
        )));
    }
    let reply = ReplyCode::try_from(head[1])?;
    if reply != ReplyCode::Succeeded {
        return Err(SpeedtestError::ProxyReply(reply as u8));
    }

    let bound = read_address(stream).await?;
    let bound_port = stream.read_u16().await?;
    trace!(%bound, bound_port, ?command, "SOCKS5 request accepted");
    Ok((bound, bound_port))
}

/// CONNECT to `address:port` over an already negotiated stream.
pub async fn connect<S>(stream: &mut S, address: &Address, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    request(stream, Command::Connect, address, port).await.map(|_| ())
}

/// UDP ASSOCIATE; returns the relay address the proxy wants datagrams sent to.
pub async fn udp_associate<S>(stream: &mut S) -> Result<(Address, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    request(stream, Command::UdpAssociate, &Address::IPv4([0, 0, 0, 0]), 0).await
}

pub(crate) fn write_address(buf: &mut Vec<u8>, address: &Address) -> Result<()> {
    match address {
        Address::IPv4(octets) => {
            buf.push(0x01);
            buf.extend_from_slice(octets);
        }
        Address::IPv6(octets) => {
            buf.push(0x04);
            buf.extend_from_slice(octets);
        }
        Address::Domain(domain) => {
            if domain.is_empty() || domain.len() > 255 {
                return Err(SpeedtestError::Protocol(format!(
                    "Domain length out of range: {}",
                    domain.len()
                )));
            }
            buf.push(0x03);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
    }
    Ok(())
}

async fn read_address<S>(stream: &mut S) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    let address_type = stream.read_u8().await?;
    match address_type {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ok(Address::IPv4(addr))
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| SpeedtestError::Protocol("Invalid domain encoding".to_string()))?;
            Ok(Address::Domain(domain))
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ok(Address::IPv6(addr))
        }
        other => Err(SpeedtestError::UnsupportedAddressType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_negotiate_no_auth() {
        let (mut client, mut server) = duplex(64);
        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();
        });

        let method = negotiate(&mut client, None).await.unwrap();
        assert_eq!(method, AuthMethod::NoAuth);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_userpass() {
        let (mut client, mut server) = duplex(64);
        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 2 + 5 + 1 + 6];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth[2..7], b"alice");
            assert_eq!(&auth[8..], b"secret");
            server.write_all(&[0x01, 0x00]).await.unwrap();
        });

        let creds = Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        let method = negotiate(&mut client, Some(&creds)).await.unwrap();
        assert_eq!(method, AuthMethod::UserPass);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_rejected() {
        let (mut client, mut server) = duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        assert!(matches!(
            negotiate(&mut client, None).await,
            Err(SpeedtestError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_reply_failure() {
        let (mut client, mut server) = duplex(128);
        tokio::spawn(async move {
            let mut req = [0u8; 4 + 1 + 11 + 2];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(req[1], Command::Connect as u8);
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let result = connect(&mut client, &Address::Domain("example.com".into()), 80).await;
        assert!(matches!(result, Err(SpeedtestError::ProxyReply(0x05))));
    }

    #[tokio::test]
    async fn test_udp_associate_returns_relay() {
        let (mut client, mut server) = duplex(128);
        tokio::spawn(async move {
            let mut req = [0u8; 10];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(req[1], Command::UdpAssociate as u8);
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
                .await
                .unwrap();
        });

        let (addr, port) = udp_associate(&mut client).await.unwrap();
        assert_eq!(addr, Address::IPv4([127, 0, 0, 1]));
        assert_eq!(port, 8080);
    }
}
