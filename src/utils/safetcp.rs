//! Length-prefixed TCP frame read/write and bind/connect helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::TripStoreError;

use bytes::BytesMut;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Largest frame body accepted from the wire.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Receives an object of type `T` from readable connection `conn_read`. The
/// object is expected to be preceded by its encoded length as a big-endian
/// `u64`.
///
/// Not cancellation-safe: a frame is only ever read by the task that owns
/// the (per-call) connection, never from a `tokio::select!` branch.
pub async fn read_frame<T, Conn>(
    conn_read: &mut Conn,
) -> Result<T, TripStoreError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let obj_len = conn_read.read_u64().await?;
    if obj_len > MAX_FRAME_LEN {
        return Err(TripStoreError(format!(
            "frame length {} exceeds limit {}",
            obj_len, MAX_FRAME_LEN
        )));
    }

    let mut read_buf = BytesMut::zeroed(obj_len as usize);
    conn_read.read_exact(&mut read_buf[..]).await?;
    Ok(decode_from_slice(&read_buf)?)
}

/// Sends an object of type `T` to writable connection `conn_write`, prefixed
/// by its encoded length.
pub async fn write_frame<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), TripStoreError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let write_bytes = encode_to_vec(obj)?;
    let mut write_buf = BytesMut::with_capacity(8 + write_bytes.len());
    write_buf.extend_from_slice(&(write_bytes.len() as u64).to_be_bytes());
    write_buf.extend_from_slice(&write_bytes);
    conn_write.write_all(&write_buf).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, TripStoreError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, TripStoreError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}
