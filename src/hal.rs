//! The HAL boundary.
//!
//! On a DPU the vendor SDK owns the virtio-fs queues: it hands the server
//! raw request bytes, takes back raw reply bytes, and is told per request
//! whether the reply is ready now or will be completed later. This module
//! pins down that contract ([`Dispatch`], [`Completion`]) and provides the
//! bring-up transport used on development hosts and in the integration
//! tests: FUSE messages framed over a Unix stream socket (each message is
//! self-delimiting through the length field of its header), pumped by a
//! fixed pool of poll threads.

use std::io::{self, Read, Write};
use std::mem::size_of;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::ll::fuse_abi::fuse_in_header;
use crate::ll::ReplyBuf;
use crate::server::MirrorFs;
use crate::session::BUFFER_SIZE;

/// Identifies one emulated virtio-fs device.
pub type DeviceId = u16;

/// Opaque completion token the HAL attaches to each request. It must be
/// handed back in the completion callback of an async request, unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestCtx(pub u64);

/// Outcome reported alongside an async completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Error,
}

/// What `dispatch` tells the HAL about one request.
#[derive(Debug)]
pub enum Dispatch {
    /// The reply is complete; ship it now.
    Sync(ReplyBuf),
    /// This opcode produces no reply (forget, batch-forget).
    NoReply,
    /// The reply will arrive through [`Completion::complete`], exactly once.
    Pending,
}

/// Callback surface into the HAL for async completions.
pub trait Completion: Send + Sync {
    fn complete(&self, ctx: RequestCtx, reply: ReplyBuf, status: CompletionStatus);
}

const IN_HEADER_LEN: usize = size_of::<fuse_in_header>();

/// How long a poll thread blocks in a read before rechecking shutdown.
const POLL_TICK: Duration = Duration::from_millis(500);

/// One connected queue endpoint: the development stand-in for a DPU queue
/// pair. Reads and writes are whole FUSE messages.
pub struct Endpoint {
    stream: UnixStream,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl Endpoint {
    /// Binds `path`, waits for the single queue peer, and returns the
    /// connected endpoint. A stale socket file is replaced.
    pub fn accept(path: &Path) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("waiting for queue peer on {}", path.display());
        let (stream, _addr) = listener.accept()?;
        Self::from_stream(stream)
    }

    /// Connects to a listening endpoint (used by tests and tooling).
    pub fn connect(path: &Path) -> io::Result<Self> {
        Self::from_stream(UnixStream::connect(path)?)
    }

    /// Wraps an already-connected stream.
    pub fn from_stream(stream: UnixStream) -> io::Result<Self> {
        stream.set_read_timeout(Some(POLL_TICK))?;
        Ok(Self {
            stream,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        })
    }

    /// Receives one message into `buf`. Returns the message length, 0 on
    /// orderly peer shutdown, or `WouldBlock` when the poll tick elapsed
    /// before a message started.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _held = self.read_lock.lock();
        let mut stream = &self.stream;
        match stream.read(&mut buf[..IN_HEADER_LEN]) {
            Ok(0) => return Ok(0),
            Ok(n) if n < IN_HEADER_LEN => {
                // the header straddled the tick; finish it
                read_full(stream, &mut buf[n..IN_HEADER_LEN])?;
            }
            Ok(_) => {}
            Err(e) => return Err(e),
        }
        let total = u32::from_ne_bytes(buf[0..4].try_into().expect("sliced")) as usize;
        if !(IN_HEADER_LEN..=buf.len()).contains(&total) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad message length {total}"),
            ));
        }
        read_full(stream, &mut buf[IN_HEADER_LEN..total])?;
        Ok(total)
    }

    /// Ships one reply message.
    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let _held = self.write_lock.lock();
        (&self.stream).write_all(bytes)
    }
}

/// Reads to the end of `buf`, riding out poll ticks once a message has
/// started arriving.
fn read_full(mut stream: &UnixStream, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match stream.read(&mut buf[done..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-message",
                ));
            }
            Ok(n) => done += n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl Completion for Endpoint {
    fn complete(&self, ctx: RequestCtx, reply: ReplyBuf, status: CompletionStatus) {
        if status == CompletionStatus::Error {
            debug!("async request {} completed with error {}", ctx.0, reply.error_code());
        }
        if let Err(e) = self.send(reply.bytes()) {
            error!("failed to ship async reply {}: {e}", ctx.0);
        }
    }
}

/// The fixed pool of poll threads pumping one endpoint into the server.
pub struct PollPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl PollPool {
    /// Spawns `nthreads` poll workers. The pool stops once `shutdown` is
    /// set (externally or after a peer disconnect).
    pub fn spawn(
        nthreads: usize,
        device: DeviceId,
        endpoint: Arc<Endpoint>,
        server: Arc<MirrorFs>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        server.register_device(device);
        let mut workers = Vec::with_capacity(nthreads);
        for id in 0..nthreads {
            let endpoint = Arc::clone(&endpoint);
            let server = Arc::clone(&server);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("mirrorfs-poll-{id}"))
                .spawn(move || poll_main(id, device, endpoint, server, shutdown))?;
            workers.push(handle);
        }
        Ok(Self { workers, shutdown })
    }

    /// Waits for every worker to observe shutdown and exit.
    pub fn join(self) {
        for worker in self.workers {
            let _ = worker.join();
        }
    }

    /// Requests a stop; workers exit at their next poll tick.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn poll_main(
    id: usize,
    device: DeviceId,
    endpoint: Arc<Endpoint>,
    server: Arc<MirrorFs>,
    shutdown: Arc<AtomicBool>,
) {
    // u64 storage keeps the request buffer 8-byte aligned for the
    // zerocopy argument decoding
    let mut storage = vec![0u64; BUFFER_SIZE / 8];
    let buf = zerocopy::IntoBytes::as_mut_bytes(storage.as_mut_slice());
    loop {
        if shutdown.load(Ordering::Acquire) {
            debug!("poll worker {id} exiting");
            break;
        }
        let len = match endpoint.recv(buf) {
            Ok(0) => {
                info!("queue peer disconnected, poll worker {id} stopping");
                shutdown.store(true, Ordering::Release);
                break;
            }
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("poll worker {id} receive error: {e}");
                shutdown.store(true, Ordering::Release);
                break;
            }
        };
        // the completion token is the transaction's unique id
        let unique = u64::from_ne_bytes(buf[8..16].try_into().expect("sliced"));
        match server.dispatch(device, &buf[..len], RequestCtx(unique)) {
            Dispatch::Sync(reply) => {
                if let Err(e) = endpoint.send(reply.bytes()) {
                    warn!("poll worker {id} failed to ship reply {unique}: {e}");
                }
            }
            Dispatch::NoReply => {}
            Dispatch::Pending => {}
        }
    }
}
