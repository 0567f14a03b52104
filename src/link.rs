//! Link Channel
//!
//! Owns the raw point-to-point socket to the LED strip. Nothing else in the
//! crate touches the socket handle; the coordinator works exclusively through
//! `connect` / `disconnect` / `write` and the two event streams.
//!
//! A dial that loses a race with `disconnect()` is closed on the floor and
//! never surfaces a `Connected` event.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::models::LinkState;

/// Byte stream a transport hands back on a successful dial.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

pub type BoxedStream = Box<dyn TransportStream>;

pub type DialFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedStream, LinkError>> + Send + 'a>>;

/// The dial seam. The stock implementation is [`TcpTransport`]; tests plug in
/// an in-memory pair, and a platform port would wrap its RFCOMM socket here.
pub trait Transport: Send + Sync + 'static {
    /// Open a stream to `address`, giving up after `timeout`. The address
    /// format is owned by the transport and opaque to everything above it.
    fn open<'a>(&'a self, address: &'a str, timeout: Duration) -> DialFuture<'a>;
}

/// Transport for serial-over-radio setups bridged to TCP (an SPP or serial
/// bridge listening on `host:port`).
#[derive(Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn open<'a>(&'a self, address: &'a str, timeout: Duration) -> DialFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => {
                    // Command lines are tiny; don't let Nagle sit on them.
                    let _ = stream.set_nodelay(true);
                    Ok(Box::new(stream) as BoxedStream)
                }
                Ok(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                    Err(LinkError::Refused)
                }
                Ok(Err(err)) => Err(LinkError::Io(err.to_string())),
                Err(_) => Err(LinkError::Timeout),
            }
        })
    }
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<String>,
    closing: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    epoch: u64,
}

/// The socket owner. `connect` runs on whatever task awaits it; the reader
/// and writer run on background tasks; both event streams are hot multicast
/// with no replay.
pub struct LinkChannel<T: Transport> {
    transport: T,
    state_tx: broadcast::Sender<LinkState>,
    inbound_tx: broadcast::Sender<String>,
    active: Arc<Mutex<Option<ActiveLink>>>,
    /// Bumped by every dial and every disconnect; an in-flight dial that sees
    /// a newer epoch when it lands has been superseded.
    epoch: AtomicU64,
}

impl<T: Transport> LinkChannel<T> {
    pub fn new(transport: T) -> Self {
        let (state_tx, _) = broadcast::channel(32);
        let (inbound_tx, _) = broadcast::channel(64);
        Self {
            transport,
            state_tx,
            inbound_tx,
            active: Arc::new(Mutex::new(None)),
            epoch: AtomicU64::new(0),
        }
    }

    /// Subscribe to connection-state events.
    pub fn events(&self) -> broadcast::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to decoded inbound lines (terminators stripped).
    pub fn messages(&self) -> broadcast::Receiver<String> {
        self.inbound_tx.subscribe()
    }

    /// Dial `address`. On success emits `Connected { device: address }`; on
    /// failure emits `Error(reason)` then `Disconnected`. If a `disconnect()`
    /// overtakes the dial, the late socket is closed silently.
    pub async fn connect(&self, address: &str, timeout: Duration) -> Result<(), LinkError> {
        let dial = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!("dialing {address}");

        match self.transport.open(address, timeout).await {
            Ok(stream) => {
                if self.install(dial, address, stream) {
                    info!("link to {address} established");
                } else {
                    debug!("dial to {address} superseded, dropping socket");
                }
                Ok(())
            }
            Err(err) => {
                // A superseded dial reports to no one.
                if self.epoch.load(Ordering::SeqCst) == dial {
                    warn!("dial to {address} failed: {err}");
                    let _ = self.state_tx.send(LinkState::Error(err.clone()));
                    let _ = self.state_tx.send(LinkState::Disconnected);
                }
                Err(err)
            }
        }
    }

    fn install(&self, dial: u64, address: &str, stream: BoxedStream) -> bool {
        let mut guard = self.active.lock().unwrap();
        if self.epoch.load(Ordering::SeqCst) != dial {
            return false;
        }
        if let Some(stale) = guard.take() {
            Self::quiet_close(stale);
        }

        let closing = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (read_half, mut write_half) = tokio::io::split(stream);

        tokio::spawn(async move {
            let mut outbound_rx = outbound_rx;
            while let Some(line) = outbound_rx.recv().await {
                if let Err(err) = write_half.write_all(line.as_bytes()).await {
                    warn!("link write failed: {err}");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader = tokio::spawn(read_loop(
            read_half,
            self.inbound_tx.clone(),
            self.state_tx.clone(),
            Arc::clone(&closing),
            Arc::clone(&self.active),
            dial,
        ));

        *guard = Some(ActiveLink {
            outbound,
            closing,
            reader,
            epoch: dial,
        });
        drop(guard);

        let _ = self.state_tx.send(LinkState::Connected {
            device: address.to_string(),
        });
        true
    }

    /// Close the link. Idempotent: closing an already-closed channel is a
    /// no-op success, but every call emits exactly one `Disconnected` so
    /// downstream machines can rely on a terminal event per call.
    pub fn disconnect(&self) -> Result<(), ()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let stale = self.active.lock().unwrap().take();
        if let Some(link) = stale {
            info!("closing link");
            Self::quiet_close(link);
        }
        let _ = self.state_tx.send(LinkState::Disconnected);
        Ok(())
    }

    /// Queue one line for the device. Fire-and-forget: never blocks, and a
    /// closed socket turns the call into a no-op. Gating writes to connected
    /// states is the coordinator's job, not this layer's.
    pub fn write(&self, line: &str) {
        let guard = self.active.lock().unwrap();
        match guard.as_ref() {
            Some(link) => {
                if link.outbound.send(line.to_string()).is_err() {
                    debug!("write dropped, writer task gone");
                }
            }
            None => debug!("write ignored, link is closed"),
        }
    }

    /// Whether a socket is currently installed.
    pub fn is_open(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    fn quiet_close(link: ActiveLink) {
        link.closing.store(true, Ordering::SeqCst);
        link.reader.abort();
        // Dropping `outbound` lets the writer drain queued lines (a
        // best-effort Bye among them) and then shut the socket down.
        drop(link.outbound);
    }
}

impl<T: Transport> Drop for LinkChannel<T> {
    fn drop(&mut self) {
        if let Some(link) = self.active.lock().unwrap().take() {
            Self::quiet_close(link);
        }
    }
}

/// Line-decode inbound bytes until the socket dies or the channel closes.
/// An explicit close aborts this task, so reaching the post-loop code means
/// the socket died unexpectedly: error the stream, then end it.
async fn read_loop(
    read_half: ReadHalf<BoxedStream>,
    inbound_tx: broadcast::Sender<String>,
    state_tx: broadcast::Sender<LinkState>,
    closing: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveLink>>>,
    epoch: u64,
) {
    let mut lines = BufReader::new(read_half).lines();
    let death = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let _ = inbound_tx.send(line);
            }
            Ok(None) => break LinkError::Io("connection closed by peer".into()),
            Err(err) => break LinkError::Io(err.to_string()),
        }
    };

    if closing.load(Ordering::SeqCst) {
        return;
    }
    warn!("link died: {death}");

    // Clear the slot only if it still belongs to this socket.
    {
        let mut guard = active.lock().unwrap();
        if guard.as_ref().map(|l| l.epoch) == Some(epoch) {
            guard.take();
        }
    }
    let _ = state_tx.send(LinkState::Error(death));
    let _ = state_tx.send(LinkState::Disconnected);
}
