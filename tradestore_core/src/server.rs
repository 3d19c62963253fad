// tradestore_core/src/server.rs

//! Single-threaded request server.
//!
//! The loop blocks on the well-known request pipe, serves one fixed-size
//! request at a time and writes the answer to the client's own reply pipe.
//! A termination signal only raises a flag. Blocking opens and reads are
//! interrupted by it, the loop notices and leaves, and dropping the server
//! closes storage and removes the request pipe. A reply being written when
//! the signal lands is abandoned rather than finished.
//!
//! A signal that arrives after the flag check but before the blocking open
//! of the request pipe is only seen once the next client connects.

use anyhow::Context;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::fs::FileTypeExt;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;

use crate::layout;
use crate::query;
use crate::record;
use crate::settings;
use crate::wire;

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signal: std::ffi::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Observes whether the hosting environment asked the server to stop.
#[derive(Debug, Clone, Copy)]
pub struct Shutdown {
    flag: &'static AtomicBool,
}

impl Shutdown {
    /// Routes SIGINT and SIGTERM to the shutdown flag.
    /// Handlers are installed without `SA_RESTART` so blocked pipe calls return `EINTR`.
    pub fn install_signal_handlers() -> anyhow::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_terminate),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            // The handler only stores to an atomic.
            unsafe { nix::sys::signal::sigaction(signal, &action) }
                .with_context(|| format!("Failed to install {:?} handler", signal))?;
        }
        anyhow::Ok(Shutdown { flag: &TERMINATE })
    }

    pub fn from_flag(flag: &'static AtomicBool) -> Self {
        Shutdown { flag }
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Creates a FIFO at `path`, reusing one left behind by an earlier run.
pub fn create_fifo(path: &std::path::Path) -> anyhow::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return anyhow::Ok(()),
        Ok(_) => anyhow::bail!("{} exists and is not a named pipe", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }

    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666))
        .with_context(|| format!("Failed to create named pipe {}", path.display()))
}

/// Opens a pipe end without retrying on `EINTR`, unlike `std::fs::File::open`.
fn open_pipe(path: &std::path::Path, flags: OFlag) -> nix::Result<std::fs::File> {
    let fd = nix::fcntl::open(path, flags | OFlag::O_CLOEXEC, Mode::empty())?;
    // `fd` was just returned by open(2) and is owned by nothing else.
    Ok(unsafe { std::fs::File::from_raw_fd(fd) })
}

/// The well-known request pipe; removed when dropped.
struct RequestChannel {
    path: std::path::PathBuf,
}

impl RequestChannel {
    fn create(path: &std::path::Path) -> anyhow::Result<Self> {
        create_fifo(path)?;
        anyhow::Ok(RequestChannel { path: path.to_path_buf() })
    }
}

impl Drop for RequestChannel {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to remove request pipe {}: {}", self.path.display(), e);
        }
    }
}

/// Everything the server holds for its lifetime.
pub struct ServerState {
    engine: query::QueryEngine,
    settings: settings::ServerSettings,
}

/// The answer to one request frame.
#[derive(Debug)]
pub struct Reply {
    pub client_pid: i32,
    /// `None` when the frame could not be decoded.
    pub access: Option<query::AccessPath>,
    pub records: Vec<record::Record>,
}

impl ServerState {
    /// Loads metadata and the block index and opens the backing files.
    pub fn load(settings: &settings::Settings) -> anyhow::Result<Self> {
        let layout = layout::StoreLayout::from_settings(&settings.storage);
        let engine = query::QueryEngine::open(&layout, settings.server.access)
            .context("Failed to load the store")?;
        anyhow::Ok(Self::new(engine, settings.server.clone()))
    }

    pub fn new(engine: query::QueryEngine, settings: settings::ServerSettings) -> Self {
        ServerState { engine, settings }
    }

    pub fn engine(&self) -> &query::QueryEngine {
        &self.engine
    }

    /// Decodes and answers one request. Malformed requests and failed
    /// searches answer with no records.
    pub fn handle(&self, frame: &[u8; wire::REQUEST_SIZE], shutdown: &Shutdown) -> Reply {
        let frame = wire::decode_request(frame);
        let client_pid = frame.client_pid;

        let (access, records) = match frame.search {
            Ok(request) => {
                let path = request.plan();
                match self.engine.search_until(&request, &|| shutdown.requested()) {
                    Ok(records) => (Some(path), records),
                    Err(_) if shutdown.requested() => {
                        log::info!("Abandoned {} for pid {} on shutdown", path, client_pid);
                        (Some(path), Vec::new())
                    }
                    Err(e) => {
                        log::error!("Search for pid {} failed: {:#}", client_pid, e);
                        (Some(path), Vec::new())
                    }
                }
            }
            Err(e) => {
                log::warn!("Malformed request from pid {}: {}", client_pid, e);
                (None, Vec::new())
            }
        };

        Reply { client_pid, access, records }
    }

    /// Closes the backing files and drops the block index.
    pub fn release(self) {
        let metadata = *self.engine.metadata();
        drop(self);
        log::info!(
            "Released store ({} records, {} blocks)",
            metadata.record_count,
            metadata.block_count,
        );
    }
}

/// Counters returned when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeStats {
    pub served: u64,
    pub failed: u64,
}

enum FrameRead {
    Complete,
    Closed,
    Partial(usize),
}

pub struct Server {
    // Field order matters: the pipe is removed before storage is released.
    channel: RequestChannel,
    state: ServerState,
}

impl Server {
    /// Creates the well-known request pipe.
    pub fn bind(state: ServerState) -> anyhow::Result<Self> {
        let channel = RequestChannel::create(std::path::Path::new(&state.settings.request_pipe))?;
        anyhow::Ok(Server { channel, state })
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn request_pipe(&self) -> &std::path::Path {
        &self.channel.path
    }

    /// Serves requests until `shutdown` is raised, then releases everything.
    pub fn run(self, shutdown: &Shutdown) -> anyhow::Result<ServeStats> {
        let mut stats = ServeStats::default();

        while !shutdown.requested() {
            log::debug!("Waiting for client requests...");
            let mut pipe = match open_pipe(&self.channel.path, OFlag::O_RDONLY) {
                Ok(pipe) => pipe,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.shutdown();
                    return Err(e).context("Failed to open the request pipe");
                }
            };

            // Requests queued by several writers are served one after another.
            while !shutdown.requested() {
                let mut frame = [0u8; wire::REQUEST_SIZE];
                match read_frame(&mut pipe, &mut frame, shutdown) {
                    Ok(FrameRead::Complete) => {
                        if self.serve(&frame, shutdown) {
                            stats.served += 1;
                        } else {
                            stats.failed += 1;
                        }
                    }
                    Ok(FrameRead::Closed) => break,
                    Ok(FrameRead::Partial(n)) => {
                        log::warn!("Discarding partial request of {} bytes", n);
                        stats.failed += 1;
                        break;
                    }
                    Err(e) => {
                        log::warn!("Error reading request: {}", e);
                        stats.failed += 1;
                        break;
                    }
                }
            }
        }

        log::info!(
            "Shutdown requested after {} requests ({} failed)",
            stats.served + stats.failed,
            stats.failed,
        );
        self.shutdown();
        anyhow::Ok(stats)
    }

    /// Answers one frame; false when the reply could not be delivered.
    fn serve(&self, frame: &[u8; wire::REQUEST_SIZE], shutdown: &Shutdown) -> bool {
        let reply = self.state.handle(frame, shutdown);
        if shutdown.requested() {
            log::info!("Dropping in-flight request from pid {}", reply.client_pid);
            return false;
        }
        if reply.client_pid <= 0 {
            log::warn!("Request carries invalid client pid {}", reply.client_pid);
            return false;
        }

        let bytes = match wire::encode_response(&reply.records) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Cannot encode reply for pid {}: {:#}", reply.client_pid, e);
                return false;
            }
        };

        let path = self.state.settings.response_pipe(reply.client_pid);
        let mut pipe = match open_pipe(&path, OFlag::O_WRONLY) {
            Ok(pipe) => pipe,
            Err(e) => {
                log::warn!("Cannot open response pipe {}: {}", path.display(), e);
                return false;
            }
        };

        if let Err(e) = write_reply(&mut pipe, &bytes, shutdown) {
            log::warn!("Failed to answer pid {}: {}", reply.client_pid, e);
            return false;
        }

        match reply.access {
            Some(path) => log::info!(
                "Search complete for pid {} by {}. Results: {}",
                reply.client_pid,
                path,
                reply.records.len(),
            ),
            None => log::info!("Answered malformed request from pid {} with no results", reply.client_pid),
        }
        true
    }

    /// Removes the request pipe, then closes storage.
    pub fn shutdown(self) {
        let Server { channel, state } = self;
        drop(channel);
        state.release();
    }
}

/// Writes `bytes` with plain `write` calls so an interrupting signal ends
/// the delivery instead of being retried past.
fn write_reply<W: Write>(pipe: &mut W, bytes: &[u8], shutdown: &Shutdown) -> std::io::Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        if shutdown.requested() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                format!("shutdown after {} of {} bytes", written, bytes.len()),
            ));
        }
        match pipe.write(&bytes[written..]) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_frame(
    pipe: &mut std::fs::File,
    frame: &mut [u8; wire::REQUEST_SIZE],
    shutdown: &Shutdown,
) -> std::io::Result<FrameRead> {
    let mut filled = 0;
    while filled < frame.len() {
        match pipe.read(&mut frame[filled..]) {
            Ok(0) if filled == 0 => return Ok(FrameRead::Closed),
            Ok(0) => return Ok(FrameRead::Partial(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                if shutdown.requested() {
                    return Ok(FrameRead::Closed);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(FrameRead::Complete)
}
