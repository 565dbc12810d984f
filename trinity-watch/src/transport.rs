//! Phone link: TCP listener, version handshake, length-prefixed JSON frames.
//! One phone at a time; a new connection replaces the previous one.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use trinity_core::wire::{decode_body, encode_frame, frame_len, LEN_SIZE};
use trinity_core::{Envelope, PROTOCOL_VERSION};

pub type ConnId = u64;

/// Event from the link into the watch event loop.
#[derive(Debug)]
pub enum LinkEvent {
    Connected(ConnId, mpsc::UnboundedSender<Envelope>),
    Received(ConnId, Envelope),
    Disconnected(ConnId),
}

pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await
}

/// Accept phone connections until the event loop goes away.
pub async fn run_listener(listener: TcpListener, events: mpsc::UnboundedSender<LinkEvent>) {
    let mut next_id: ConnId = 0;
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                log::error!("accept failed: {}", e);
                break;
            }
        };
        next_id += 1;
        let id = next_id;
        let conn_events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = handshake(&mut stream).await {
                log::warn!("handshake with {} failed: {}", addr, e);
                return;
            }
            log::info!("phone connected from {}", addr);
            run_connection(stream, id, conn_events).await;
        });
        if events.is_closed() {
            break;
        }
    }
}

async fn handshake(stream: &mut TcpStream) -> std::io::Result<()> {
    let (mut r, mut w) = stream.split();
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).await?;
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    w.write_all(&[PROTOCOL_VERSION]).await?;
    w.flush().await
}

async fn run_connection(stream: TcpStream, id: ConnId, events: mpsc::UnboundedSender<LinkEvent>) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
    if events.send(LinkEvent::Connected(id, tx)).is_err() {
        return;
    }
    tokio::spawn(write_frames(writer, rx));
    read_frames(reader, id, &events).await;
    let _ = events.send(LinkEvent::Disconnected(id));
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

async fn read_frames(mut reader: OwnedReadHalf, id: ConnId, events: &mpsc::UnboundedSender<LinkEvent>) {
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = match frame_len(&len_buf) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("closing phone link: {}", e);
                break;
            }
        };
        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }
        match decode_body(&body) {
            Ok(env) => {
                if events.send(LinkEvent::Received(id, env)).is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("skipping undecodable frame: {}", e),
        }
    }
}
