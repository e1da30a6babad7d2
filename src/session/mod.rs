//! TCP sessions: OpenFlow framing plus one reader loop and one writer task
//! per peer.
//!
//! Sessions stay thin. Every decision that touches shared state is made by
//! the engine under its lock; the reader loops only frame, decode and hand
//! over, the writer tasks only drain their channel in order.

mod controller;
mod switch;

pub(crate) use controller::run_controller_session;
pub(crate) use switch::run_switch_session;

use crate::wire::{Frame, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Read one length-framed OpenFlow message, header included. `None` is a
/// clean end of stream on a frame boundary.
pub(crate) async fn read_frame_bytes<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let declared = u16::from_be_bytes([header[2], header[3]]) as usize;
    if declared < HEADER_LEN {
        // The stream cannot be resynchronized once the length field lies.
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame length below header size",
        ));
    }
    let mut frame = vec![0u8; declared];
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_LEN..]).await?;
    Ok(Some(frame))
}

/// Drain the session's outbound channel onto the socket, preserving order.
pub(crate) fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let bytes = frame.encode();
            trace!(len = bytes.len(), msg_type = frame.message.type_code(), "sending frame");
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    })
}
