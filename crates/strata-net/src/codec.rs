//! Bincode codec for the `/strata/replicate` request/response protocol.

use std::io;

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::{request_response::Codec, StreamProtocol};

use strata_shared::constants::{MAX_BLOB_SIZE, REPLICATE_PROTOCOL};
use strata_shared::protocol::{NodeRequest, NodeResponse};

pub const PROTOCOL: StreamProtocol = StreamProtocol::new(REPLICATE_PROTOCOL);

/// Upper bound on a single frame: the largest blob plus envelope slack.
const MAX_FRAME_SIZE: u64 = MAX_BLOB_SIZE as u64 + 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ReplicateCodec;

async fn read_frame<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    io.take(MAX_FRAME_SIZE + 1).read_to_end(&mut buf).await?;
    if buf.len() as u64 > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    Ok(buf)
}

async fn write_frame<T>(io: &mut T, buf: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    io.write_all(buf).await?;
    io.close().await?;
    Ok(())
}

fn invalid(e: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[async_trait]
impl Codec for ReplicateCodec {
    type Protocol = StreamProtocol;
    type Request = NodeRequest;
    type Response = NodeResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_frame(io).await?;
        NodeRequest::from_bytes(&buf).map_err(invalid)
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_frame(io).await?;
        NodeResponse::from_bytes(&buf).map_err(invalid)
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let buf = req.to_bytes().map_err(invalid)?;
        write_frame(io, &buf).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let buf = res.to_bytes().map_err(invalid)?;
        write_frame(io, &buf).await
    }
}
