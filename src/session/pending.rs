//! Connection establishment.
//!
//! Socket resolve/connect is blocking, so it runs on a dedicated worker
//! thread that touches nothing but its own socket handle; the result
//! comes back to the session thread as a [`WireEvent`]. The session
//! joins the worker before consuming the result. Cancellation is
//! identity based: each attempt carries an id, and a result whose id no
//! longer matches the current pending attempt reports
//! [`Error::Canceled`](crate::session::error::Error::Canceled) to the
//! original callback instead of delivering a stale stream.

use crate::protocol::codec::{self, Header, HEADER_SIZE};
use crate::protocol::{HelloReply, HelloRequest, MsgType, HELLO_MAGIC, PROTOCOL_VERSION};
use crate::session::error::Error;
use crate::session::remote::Callback;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use timeout_readwrite::TimeoutReader;

/// Ceiling for a handshake reply body; anything bigger is corruption.
const MAX_HANDSHAKE_BODY: u32 = 4096;

/// How long the synchronous hello exchange may take.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Events produced by the connection worker and the stream reader,
/// consumed on the session thread.
pub enum WireEvent {
    ConnectResult {
        id: u32,
        result: std::io::Result<TcpStream>,
    },
    Bytes(Vec<u8>),
    Closed(Option<std::io::Error>),
}

/// One in-flight connection attempt. The callback stays on the session
/// thread; only plain data crosses the thread boundary.
pub(crate) struct PendingConnection {
    pub id: u32,
    pub cb: Option<Callback<()>>,
    pub worker: Option<JoinHandle<()>>,
}

/// Blocking resolve+connect on a worker thread, result posted back.
pub(crate) fn spawn_connect(id: u32, addr: String, tx: Sender<WireEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        log::debug!(target: "session", "connecting to {addr} (attempt {id})");
        let result = TcpStream::connect(addr.as_str());
        // the session may be gone already, a dead channel is fine
        let _ = tx.send(WireEvent::ConnectResult { id, result });
    })
}

/// Pump raw bytes from the agent socket into the session channel until
/// EOF or error.
pub(crate) fn spawn_reader(stream: TcpStream, tx: Sender<WireEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut stream = stream;
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.send(WireEvent::Closed(None));
                    return;
                }
                Ok(n) => {
                    if tx.send(WireEvent::Bytes(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(WireEvent::Closed(Some(e)));
                    return;
                }
            }
        }
    })
}

/// Synchronous hello exchange, performed on the session thread before
/// the general request/reply machinery is wired up: write the request,
/// read exactly one framed reply under a deadline, validate signature
/// and protocol version. A version mismatch is a hard connect failure,
/// there is no negotiation.
pub(crate) fn handshake(stream: &TcpStream, transaction_id: u32) -> Result<HelloReply, Error> {
    let frame = codec::encode(MsgType::Hello, transaction_id, &HelloRequest::default())?;
    (&*stream).write_all(&frame)?;
    (&*stream).flush()?;

    let mut reader = TimeoutReader::new(stream.try_clone()?, HANDSHAKE_TIMEOUT);

    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf)?;
    let header = Header::parse(&header_buf).expect("buffer is exactly one header");

    if header.msg_type != MsgType::Hello as u32 || header.size > MAX_HANDSHAKE_BODY {
        return Err(Error::BadHandshakeMagic);
    }
    let mut body = vec![0u8; header.size as usize];
    reader.read_exact(&mut body)?;

    let reply: HelloReply = codec::decode_body(&body)?;
    if reply.magic != HELLO_MAGIC {
        return Err(Error::BadHandshakeMagic);
    }
    if reply.version != PROTOCOL_VERSION {
        return Err(Error::VersionMismatch {
            agent: reply.version,
            client: PROTOCOL_VERSION,
        });
    }
    Ok(reply)
}
