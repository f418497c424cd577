use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};
use libp2p::{
    core::{
        upgrade::{read_length_prefixed, write_length_prefixed},
        ProtocolName,
    },
    request_response::RequestResponseCodec,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{io, marker::PhantomData};

/// Upper bound on a single framed request or response.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Request-response codec that frames bincode encoded values with a
/// varint length prefix.
pub struct BincodeCodec<P, Req, Res> {
    _marker: PhantomData<fn() -> (P, Req, Res)>,
}

impl<P, Req, Res> Default for BincodeCodec<P, Req, Res> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<P, Req, Res> Clone for BincodeCodec<P, Req, Res> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

async fn read_value<T, V>(io: &mut T) -> io::Result<V>
where
    T: AsyncRead + Unpin + Send,
    V: DeserializeOwned,
{
    let bytes = read_length_prefixed(io, MAX_FRAME_SIZE).await?;
    if bytes.is_empty() {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    bincode::deserialize(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_value<T, V>(io: &mut T, value: &V) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    V: Serialize,
{
    let bytes =
        bincode::serialize(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {}", bytes.len(), MAX_FRAME_SIZE),
        ));
    }
    write_length_prefixed(io, bytes).await?;
    io.close().await
}

#[async_trait]
impl<P, Req, Res> RequestResponseCodec for BincodeCodec<P, Req, Res>
where
    P: ProtocolName + Send + Sync + Clone,
    Req: Serialize + DeserializeOwned + Send + Sync,
    Res: Serialize + DeserializeOwned + Send + Sync,
{
    type Protocol = P;
    type Request = Req;
    type Response = Res;

    async fn read_request<T>(&mut self, _: &P, io: &mut T) -> io::Result<Req>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_value(io).await
    }

    async fn read_response<T>(&mut self, _: &P, io: &mut T) -> io::Result<Res>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_value(io).await
    }

    async fn write_request<T>(&mut self, _: &P, io: &mut T, request: Req) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_value(io, &request).await
    }

    async fn write_response<T>(&mut self, _: &P, io: &mut T, response: Res) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_value(io, &response).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::exchange::{ExchangeCodec, ExchangeProtocol, ExchangeResponse};
    use super::super::message::{ChatMessage, Envelope};
    use super::*;
    use futures::io::Cursor;

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let mut codec = ExchangeCodec::default();
        let envelope = Envelope::new(&ChatMessage {
            message: "77".to_string(),
        })
        .unwrap();

        let mut io = Cursor::new(Vec::new());
        codec
            .write_request(&ExchangeProtocol, &mut io, envelope.clone())
            .await
            .unwrap();
        io.set_position(0);
        let read = codec.read_request(&ExchangeProtocol, &mut io).await.unwrap();
        assert_eq!(read, envelope);

        let mut io = Cursor::new(Vec::new());
        codec
            .write_response(&ExchangeProtocol, &mut io, ExchangeResponse::Bad)
            .await
            .unwrap();
        io.set_position(0);
        let read = codec
            .read_response(&ExchangeProtocol, &mut io)
            .await
            .unwrap();
        assert_eq!(read, ExchangeResponse::Bad);
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let mut codec = ExchangeCodec::default();
        let mut io = Cursor::new(Vec::new());
        assert!(codec.read_request(&ExchangeProtocol, &mut io).await.is_err());

        let mut io = Cursor::new(vec![3u8, 1, 2]);
        assert!(codec.read_request(&ExchangeProtocol, &mut io).await.is_err());
    }
}
