//! Watch link: TCP connector with reconnect, version handshake,
//! length-prefixed JSON frames. Reports reachability as link events.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use trinity_core::wire::{decode_body, encode_frame, frame_len, LEN_SIZE};
use trinity_core::{Envelope, PROTOCOL_VERSION};

/// Event from the link into the phone event loop.
#[derive(Debug)]
pub enum LinkEvent {
    Connected(mpsc::UnboundedSender<Envelope>),
    Received(Envelope),
    Disconnected,
}

/// Keep a link to the watch up until the event loop goes away.
pub async fn run_connector(
    addr: String,
    retry: Duration,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut warned = false;
    while !events.is_closed() {
        match connect(&addr).await {
            Ok(stream) => {
                warned = false;
                log::info!("linked to watch at {}", addr);
                run_connection(stream, &events).await;
                if events.send(LinkEvent::Disconnected).is_err() {
                    break;
                }
            }
            Err(e) => {
                if !warned {
                    log::warn!("watch at {} not reachable: {}", addr, e);
                    warned = true;
                }
            }
        }
        tokio::time::sleep(retry).await;
    }
}

async fn connect(addr: &str) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&[PROTOCOL_VERSION]).await?;
    stream.flush().await?;
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    Ok(stream)
}

async fn run_connection(stream: TcpStream, events: &mpsc::UnboundedSender<LinkEvent>) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
    if events.send(LinkEvent::Connected(tx)).is_err() {
        return;
    }
    let writer_task = tokio::spawn(write_frames(writer, rx));
    read_frames(reader, events).await;
    writer_task.abort();
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(env) = rx.recv().await {
        let bytes = match encode_frame(&env) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("dropping outbound message: {}", e);
                continue;
            }
        };
        if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
}

async fn read_frames(mut reader: OwnedReadHalf, events: &mpsc::UnboundedSender<LinkEvent>) {
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = match frame_len(&len_buf) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("closing watch link: {}", e);
                break;
            }
        };
        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }
        match decode_body(&body) {
            Ok(env) => {
                if events.send(LinkEvent::Received(env)).is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("skipping undecodable frame: {}", e),
        }
    }
}
