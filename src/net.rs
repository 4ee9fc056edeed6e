//! TCP transport: connection setup, the framed session loop, and the
//! file-stream sub-protocol, shared by both the Listener and the
//! Initiator roles.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use socket2::{Domain, Socket, Type};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, SemaphorePermit};

use crate::error::ExecuteOutcome;
use crate::hash::human_size;
use crate::index;
use crate::protocol::{self, Frame, FileStreamHeader, OpCode, ProtocolLimits};
use crate::syncer::{self, Config};

/// Chunk size used for every streamed read/write so a single file transfer
/// never demands one giant contiguous buffer.
const ALLOCATION_SIZE: usize = 1024 * 1024;

/// How often the header-read loop re-checks the shutdown flag while idle.
const HEADER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A connected, framed command channel. Cheap to clone: every field is
/// reference-counted, so a detached worker task can share the same socket
/// halves and locks as the main dispatch loop.
#[derive(Clone)]
pub struct Session {
    reader: Arc<Mutex<OwnedReadHalf>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    tx_lock: Arc<Semaphore>,
    rx_lock: Arc<Semaphore>,
    limits: ProtocolLimits,
    rate: Arc<RateLimiter>,
    quit: Arc<AtomicBool>,
}

struct RateLimiter {
    hz: f64,
    last: Mutex<Instant>,
}

impl RateLimiter {
    fn new(hz: f64) -> Self {
        Self { hz, last: Mutex::new(Instant::now()) }
    }

    /// Sleeps just long enough to keep sends spaced by `1/hz` seconds.
    /// `hz <= 0.0` means unlimited.
    async fn throttle(&self) {
        if self.hz <= 0.0 {
            return;
        }
        let slot = Duration::from_secs_f64(1.0 / self.hz);
        let mut last = self.last.lock().await;
        let elapsed = last.elapsed();
        if elapsed < slot {
            tokio::time::sleep(slot - elapsed).await;
        }
        *last = Instant::now();
    }
}

impl Session {
    fn new(stream: TcpStream, limits: ProtocolLimits, rate_hz: f64) -> Self {
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            tx_lock: Arc::new(Semaphore::new(1)),
            rx_lock: Arc::new(Semaphore::new(1)),
            limits,
            rate: Arc::new(RateLimiter::new(rate_hz)),
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// Acquires the transmit lock. Callers that need both locks (a fetch
    /// request followed by receiving its reply) must acquire receive first,
    /// per the documented lock order.
    pub async fn acquire_transmit(&self) -> SemaphorePermit<'_> {
        self.tx_lock.acquire().await.expect("tx_lock is never closed")
    }

    pub async fn acquire_receive(&self) -> SemaphorePermit<'_> {
        self.rx_lock.acquire().await.expect("rx_lock is never closed")
    }

    /// Like `acquire_receive`, but returns a permit with no borrow on
    /// `self`, so it can be moved into a detached `tokio::spawn`ed task.
    /// Must be awaited in the caller's own task, not inside the spawned
    /// one — otherwise the spawned task's acquisition could lose a race
    /// against the dispatch loop's next `recv_frame` call for the same
    /// permit, letting the loop start reading the next header mid-stream.
    pub async fn acquire_receive_owned(&self) -> OwnedSemaphorePermit {
        self.rx_lock.clone().acquire_owned().await.expect("rx_lock is never closed")
    }

    /// Sends one frame, throttled by the configured transmit rate.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode(&self.limits)?;
        self.rate.throttle().await;
        let mut writer = self.writer.lock().await;
        for chunk in bytes.chunks(ALLOCATION_SIZE) {
            writer.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Reads one frame, or `None` if shutdown was requested while idle.
    ///
    /// Holds the receive lock for the entire header-plus-payload read. The
    /// command this protocol is modeled on released its equivalent lock
    /// between retries of the header poll, which let a second reader race in
    /// mid-frame; this version never releases the lock until the whole frame
    /// has landed.
    pub async fn recv_frame(&self) -> Result<Option<Frame>> {
        let _permit = self.acquire_receive().await;
        let mut header = [0u8; protocol::HEADER_SIZE as usize];
        let mut filled = 0usize;
        loop {
            if self.quit.load(Ordering::SeqCst) && filled == 0 {
                return Ok(None);
            }
            let mut reader = self.reader.lock().await;
            match tokio::time::timeout(HEADER_POLL_INTERVAL, reader.read(&mut header[filled..])).await {
                Ok(Ok(0)) => bail!("peer closed the connection while reading a frame header"),
                Ok(Ok(n)) => {
                    filled += n;
                    drop(reader);
                    if filled == header.len() {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e).context("reading frame header"),
                Err(_) => continue, // poll timeout: loop back and re-check the quit flag
            }
        }
        let total_size = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let opcode = OpCode::from_wire(header[8])?;
        let payload_len = total_size
            .checked_sub(protocol::HEADER_SIZE)
            .ok_or_else(|| anyhow!("frame declared size {total_size} is smaller than the header"))?;
        if payload_len > self.limits.max_payload_size {
            bail!(
                "frame payload of {payload_len} bytes exceeds max_payload_size {}",
                self.limits.max_payload_size
            );
        }
        let mut payload = vec![0u8; payload_len as usize];
        {
            let mut reader = self.reader.lock().await;
            reader.read_exact(&mut payload).await.context("reading frame payload")?;
        }
        Ok(Some(Frame::from_parts(total_size, opcode, payload)?))
    }

    /// Streams a local file directly onto the socket as
    /// `path_len||path||mtime_len||mtime||file_size||bytes`, outside any
    /// frame's declared size. Caller holds the transmit permit.
    pub async fn send_file_stream(&self, local_path: &Path, remote_rel_path: &str) -> Result<()> {
        let metadata = tokio::fs::metadata(local_path)
            .await
            .with_context(|| format!("stat'ing {}", local_path.display()))?;
        let mtime = index::format_mtime(metadata.modified()?);
        let file_size = metadata.len();
        if file_size > self.limits.max_file_size {
            bail!(
                "{} is {file_size} bytes, exceeds max_file_size {}",
                local_path.display(),
                self.limits.max_file_size
            );
        }
        println!("sending {remote_rel_path} ({})", human_size(file_size));
        let header = FileStreamHeader { path: remote_rel_path.to_string(), mtime, file_size };
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&header.encode()?).await?;
        }
        if file_size == 0 {
            return Ok(());
        }
        let mut file = File::open(local_path)
            .await
            .with_context(|| format!("opening {}", local_path.display()))?;
        let mut remaining = file_size;
        let mut buf = vec![0u8; ALLOCATION_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..want]).await?;
            self.rate.throttle().await;
            let mut writer = self.writer.lock().await;
            writer.write_all(&buf[..want]).await?;
            remaining -= want as u64;
        }
        Ok(())
    }

    /// Writes a zero-byte placeholder file stream, used in place of a
    /// last-run index file that does not exist yet on a first sync.
    pub async fn send_empty_file_stream(&self, remote_rel_path: &str) -> Result<()> {
        let header = FileStreamHeader {
            path: remote_rel_path.to_string(),
            mtime: index::format_mtime(std::time::SystemTime::now()),
            file_size: 0,
        };
        let mut writer = self.writer.lock().await;
        writer.write_all(&header.encode()?).await?;
        Ok(())
    }

    /// Reads one file-stream sub-protocol transfer into `dest_path`,
    /// creating parent directories as needed and restoring the sent mtime.
    /// Caller holds the receive permit.
    pub async fn recv_file_stream(&self, dest_path: &Path) -> Result<FileStreamHeader> {
        let mut reader = self.reader.lock().await;
        let path = read_length_prefixed_string(&mut reader, self.limits.max_string_size).await?;
        let mtime = read_length_prefixed_string(&mut reader, self.limits.max_string_size).await?;
        let mut size_buf = [0u8; 8];
        reader.read_exact(&mut size_buf).await?;
        let file_size = u64::from_le_bytes(size_buf);
        if file_size > self.limits.max_file_size {
            bail!(
                "incoming file stream of {file_size} bytes exceeds max_file_size {}",
                self.limits.max_file_size
            );
        }
        println!("receiving {path} ({})", human_size(file_size));
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let mut out = File::create(dest_path)
            .await
            .with_context(|| format!("creating {}", dest_path.display()))?;
        let mut remaining = file_size;
        let mut buf = vec![0u8; ALLOCATION_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            reader.read_exact(&mut buf[..want]).await?;
            out.write_all(&buf[..want]).await?;
            remaining -= want as u64;
        }
        out.flush().await?;
        drop(out);
        if let Ok(restored) = index::parse_mtime(&mtime) {
            let ft = filetime::FileTime::from_system_time(restored);
            filetime::set_file_mtime(dest_path, ft).ok();
        }
        Ok(FileStreamHeader { path, mtime, file_size })
    }
}

#[cfg(test)]
async fn connected_pair() -> (Session, Session) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client_res, server_res) = tokio::join!(TcpStream::connect(addr), async {
        let (stream, _) = listener.accept().await.unwrap();
        stream
    });
    let client = client_res.unwrap();
    let server = server_res;
    (
        Session::new(client, ProtocolLimits::default(), 0.0),
        Session::new(server, ProtocolLimits::default(), 0.0),
    )
}

async fn read_length_prefixed_string(reader: &mut OwnedReadHalf, max_len: u64) -> Result<String> {
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf).await?;
    let len = u64::from_le_bytes(len_buf);
    if len > max_len {
        bail!("string length {len} exceeds limit {max_len}");
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).context("non-utf8 string on the file-stream sub-protocol")
}

/// Binds with `SO_REUSEADDR`/`SO_REUSEPORT` so a restarted listener doesn't
/// have to wait out `TIME_WAIT` on the previous socket.
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).context("converting bound socket to a tokio listener")
}

/// Runs the Listener side for as long as the process should keep accepting
/// connections: BIND, then ACCEPT/DISPATCH/CLOSE in a loop.
pub async fn run_listener(bind_addr: SocketAddr, cfg: Config) -> Result<()> {
    let listener = bind_listener(bind_addr)?;
    println!("listening on {bind_addr}");
    loop {
        let (stream, peer) = listener.accept().await?;
        println!("accepted connection from {peer}");
        let session = Session::new(stream, cfg.limits, cfg.rate_hz);
        spawn_quit_on_ctrl_c(session.clone());
        let exit_after_sync = cfg.exit_after_sync;
        if let Err(e) = dispatch_loop(session, Role::Listener, cfg.clone()).await {
            eprintln!("session with {peer} ended: {e:#}");
        }
        if exit_after_sync {
            break;
        }
    }
    Ok(())
}

/// Runs the Initiator side once: CONNECT, REQUEST_INDEX, then
/// DISPATCH/CLOSE.
pub async fn run_initiator(addr: SocketAddr, cfg: Config) -> Result<()> {
    let stream = TcpStream::connect(addr).await.with_context(|| format!("connecting to {addr}"))?;
    println!("connected to {addr}");
    let session = Session::new(stream, cfg.limits, cfg.rate_hz);
    spawn_quit_on_ctrl_c(session.clone());
    syncer::request_index(&session).await?;
    dispatch_loop(session, Role::Initiator, cfg).await
}

/// Lets Ctrl-C unstick the 10ms header-poll loop promptly instead of
/// waiting for the peer to close the connection.
fn spawn_quit_on_ctrl_c(session: Session) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            session.request_quit();
        }
    });
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Listener,
    Initiator,
}

/// Reads and handles frames until the peer disconnects, an opcode signals
/// termination, or an illegal opcode arrives for this role.
async fn dispatch_loop(session: Session, role: Role, cfg: Config) -> Result<()> {
    loop {
        let frame = match session.recv_frame().await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let opcode = frame.opcode;
        if role == Role::Initiator && opcode.is_mutation_request() {
            bail!("an initiator never receives {opcode:?}");
        }

        let outcome = match opcode {
            OpCode::IndexFolder => {
                if role == Role::Initiator {
                    bail!("an initiator never receives IndexFolder");
                }
                syncer::handle_index_folder(&session, &cfg).await?
            }
            OpCode::IndexPayload => {
                if role == Role::Listener {
                    bail!("a listener never receives IndexPayload");
                }
                // Acquired here, not inside the spawned task: see
                // `acquire_receive_owned`'s doc comment for why the order
                // matters.
                let rx = session.acquire_receive_owned().await;
                let worker_session = session.clone();
                let worker_cfg = cfg.clone();
                tokio::spawn(async move {
                    if let Err(e) = syncer::handle_index_payload(worker_session, worker_cfg, frame, rx).await {
                        eprintln!("index payload handling failed: {e:#}");
                    }
                });
                ExecuteOutcome::Continue
            }
            OpCode::MkdirRequest => syncer::handle_mkdir_request(&cfg, &frame).await?,
            OpCode::RmRequest => syncer::handle_rm_request(&cfg, &frame).await?,
            OpCode::RmdirRequest => syncer::handle_rmdir_request(&cfg, &frame).await?,
            OpCode::RemoteLocalCopy => syncer::handle_remote_local_copy(&cfg, &frame).await?,
            OpCode::FetchFileRequest => syncer::handle_fetch_file_request(&session, &cfg, &frame).await?,
            OpCode::PushFile => syncer::handle_push_file(&session, &cfg, &frame).await?,
            OpCode::Message => syncer::handle_message(&cfg, &frame).await?,
            OpCode::SyncComplete => {
                if role == Role::Initiator {
                    bail!("an initiator never receives SyncComplete");
                }
                syncer::handle_sync_complete(&session, &cfg).await?
            }
            OpCode::SyncDone => {
                if role == Role::Listener {
                    bail!("a listener never receives SyncDone");
                }
                syncer::handle_sync_done(&cfg)
            }
        };

        match outcome {
            ExecuteOutcome::Continue => continue,
            ExecuteOutcome::Terminal => return Ok(()),
            ExecuteOutcome::Fatal => bail!("fatal error handling opcode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn frame_round_trips_over_a_real_socket() {
        let (client, server) = connected_pair().await;
        let frame = Frame::empty(OpCode::SyncComplete);
        client.send_frame(&frame).await.unwrap();
        let received = server.recv_frame().await.unwrap().unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn empty_file_stream_creates_a_zero_byte_file_with_no_payload_read() {
        let (client, server) = connected_pair().await;
        let dir = tempdir().unwrap();
        let src = dir.path().join("empty.dat");
        std::fs::write(&src, b"").unwrap();
        let dst = dir.path().join("received").join("empty.dat");
        std::fs::create_dir_all(dst.parent().unwrap()).unwrap();

        let (send_res, recv_res) = tokio::join!(
            client.send_file_stream(&src, "empty.dat"),
            server.recv_file_stream(&dst)
        );
        send_res.unwrap();
        let header = recv_res.unwrap();

        assert_eq!(header.file_size, 0);
        assert_eq!(std::fs::metadata(&dst).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn outbound_send_is_not_starved_by_an_idle_receive_loop() {
        // With nothing inbound, `recv_frame`'s header-poll loop re-checks
        // every 10ms; a concurrent send on the same connection must still
        // land promptly instead of waiting for the receiver to give up.
        let (client, server) = connected_pair().await;
        let frame = Frame::empty(OpCode::Message);

        let recv_task = tokio::spawn(async move { server.recv_frame().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let send_result = tokio::time::timeout(Duration::from_millis(200), client.send_frame(&frame)).await;
        assert!(send_result.is_ok(), "send must not be starved by the idle receive poll loop");

        let received = tokio::time::timeout(Duration::from_millis(200), recv_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.opcode, OpCode::Message);
    }

    #[tokio::test]
    async fn quit_flag_unsticks_an_idle_receive_loop() {
        let (client, _server) = connected_pair().await;
        client.request_quit();
        let result = tokio::time::timeout(Duration::from_millis(200), client.recv_frame())
            .await
            .expect("recv_frame must return once quit is requested")
            .unwrap();
        assert!(result.is_none());
    }
}
