//! Authentication run on every new broker connection before protocol traffic.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::KafkaError;
use crate::protocol::{self, Codec, Request, Response, SaslHandshakeRequest};
use crate::Result;

/// Byte stream an [`Authenticator`] talks over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, stream: &mut dyn AsyncStream) -> Result<()>;
}

/// Lets every connection through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthentication;

#[async_trait]
impl Authenticator for NoAuthentication {
    async fn authenticate(&self, _stream: &mut dyn AsyncStream) -> Result<()> {
        Ok(())
    }
}

/// SASL/PLAIN: a SaslHandshake request followed by the raw `\0user\0password` token.
#[derive(Debug, Clone)]
pub struct SaslPlainAuthenticator {
    codec: Codec,
    username: String,
    password: String,
}

pub const PLAIN_MECHANISM: &str = "PLAIN";

impl SaslPlainAuthenticator {
    pub fn new(codec: Codec, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            codec,
            username: username.into(),
            password: password.into(),
        }
    }

    fn token(&self) -> Bytes {
        let mut token = BytesMut::with_capacity(self.username.len() + self.password.len() + 2);
        token.put_u8(0);
        token.put_slice(self.username.as_bytes());
        token.put_u8(0);
        token.put_slice(self.password.as_bytes());
        token.freeze()
    }
}

#[async_trait]
impl Authenticator for SaslPlainAuthenticator {
    async fn authenticate(&self, stream: &mut dyn AsyncStream) -> Result<()> {
        let request = Request::SaslHandshake(SaslHandshakeRequest {
            mechanism: PLAIN_MECHANISM.to_string(),
        });
        stream.write_all(&self.codec.encode(0, &request)?).await?;

        let (_, body) = protocol::split_response(read_frame(stream).await?)?;
        let handshake = match self.codec.decode(request.api_key(), body)? {
            Response::SaslHandshake(handshake) => handshake,
            other => {
                return Err(KafkaError::protocol(format!(
                    "unexpected {:?} response to SaslHandshake",
                    other.api_key()
                )))
            }
        };
        if handshake.error_code != 0 {
            return Err(KafkaError::AuthenticationError(format!(
                "broker refused mechanism {}, enabled mechanisms: [{}]",
                PLAIN_MECHANISM,
                handshake.enabled_mechanisms.join(", ")
            )));
        }

        let token = self.token();
        let mut frame = BytesMut::with_capacity(token.len() + 4);
        frame.put_i32(token.len() as i32);
        frame.put_slice(&token);
        stream.write_all(&frame).await?;
        stream.flush().await?;

        read_frame(stream).await.map_err(|e| {
            KafkaError::AuthenticationError(format!("SASL/PLAIN exchange failed: {}", e))
        })?;
        debug!(username = %self.username, "SASL/PLAIN authentication succeeded");
        Ok(())
    }
}

/// Largest frame accepted from a broker.
pub const MAX_FRAME_SIZE: i32 = 100 * 1024 * 1024;

/// Read one `int32`-length-prefixed frame and return it without the prefix.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Bytes> {
    let len = reader.read_i32().await?;
    if !(0..=MAX_FRAME_SIZE).contains(&len) {
        return Err(KafkaError::protocol(format!("invalid frame length {}", len)));
    }
    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await?;
    Ok(Bytes::from(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::SaslHandshakeResponse;
    use crate::protocol::{ApiVersion, RequestHeader};
    use assert_matches::assert_matches;
    use tokio::io::duplex;

    fn authenticator() -> SaslPlainAuthenticator {
        SaslPlainAuthenticator::new(Codec::new("c", "0.10.1.0").unwrap(), "user", "secret")
    }

    async fn answer_handshake(
        broker: &mut tokio::io::DuplexStream,
        error_code: i16,
        mechanisms: &[&str],
    ) {
        let request = read_frame(broker).await.unwrap();
        let header = RequestHeader::parse(&request).unwrap();
        assert_eq!(header.api_key, 17);
        let response = Response::SaslHandshake(SaslHandshakeResponse {
            error_code,
            enabled_mechanisms: mechanisms.iter().map(|m| m.to_string()).collect(),
        });
        let frame =
            protocol::encode_response(&response, ApiVersion::V0, header.correlation_id).unwrap();
        broker.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_exchange() {
        let (mut client, mut broker) = duplex(1024);
        let server = tokio::spawn(async move {
            answer_handshake(&mut broker, 0, &["PLAIN"]).await;
            let token = read_frame(&mut broker).await.unwrap();
            assert_eq!(&token[..], b"\0user\0secret");
            broker.write_all(&[0, 0, 0, 0]).await.unwrap();
        });
        authenticator().authenticate(&mut client).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_mechanism_lists_enabled_ones() {
        let (mut client, mut broker) = duplex(1024);
        let server = tokio::spawn(async move {
            answer_handshake(&mut broker, 33, &["SCRAM-SHA-256"]).await;
        });
        let result = authenticator().authenticate(&mut client).await;
        assert_matches!(result, Err(KafkaError::AuthenticationError(msg)) if msg.contains("SCRAM-SHA-256"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_connection_fails_authentication() {
        let (mut client, mut broker) = duplex(1024);
        let server = tokio::spawn(async move {
            answer_handshake(&mut broker, 0, &["PLAIN"]).await;
            let _ = read_frame(&mut broker).await;
            drop(broker);
        });
        let result = authenticator().authenticate(&mut client).await;
        assert_matches!(result, Err(KafkaError::AuthenticationError(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_rejects_negative_length() {
        let mut input: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFE];
        assert_matches!(read_frame(&mut input).await, Err(KafkaError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_no_authentication() {
        let (mut client, _broker) = duplex(8);
        tokio_test::assert_ok!(NoAuthentication.authenticate(&mut client).await);
    }
}
