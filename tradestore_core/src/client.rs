// tradestore_core/src/client.rs

//! Client side of the pipe protocol.

use anyhow::Context;
use std::io::Write;

use crate::query;
use crate::record;
use crate::server;
use crate::settings;
use crate::wire;

/// Owns a reply pipe named after this process; the pipe is removed on drop.
pub struct Client {
    client_pid: i32,
    request_pipe: std::path::PathBuf,
    reply_pipe: std::path::PathBuf,
}

impl Client {
    pub fn connect(settings: &settings::ServerSettings) -> anyhow::Result<Self> {
        let client_pid = nix::unistd::getpid().as_raw();
        let reply_pipe = settings.response_pipe(client_pid);
        server::create_fifo(&reply_pipe)?;

        anyhow::Ok(Client {
            client_pid,
            request_pipe: settings.request_pipe.clone().into(),
            reply_pipe,
        })
    }

    pub fn client_pid(&self) -> i32 {
        self.client_pid
    }

    /// Sends one request and waits for its answer.
    /// Blocks while the server is busy with other clients.
    pub fn search(&self, request: &query::SearchRequest) -> anyhow::Result<Vec<record::Record>> {
        let frame = wire::encode_request(self.client_pid, request)?;

        {
            let mut pipe = std::fs::OpenOptions::new()
                .write(true)
                .open(&self.request_pipe)
                .with_context(|| format!(
                    "Cannot reach the server at {} (is it running?)",
                    self.request_pipe.display(),
                ))?;
            pipe.write_all(&frame).context("Failed to send request")?;
        }

        let reply = std::fs::File::open(&self.reply_pipe)
            .with_context(|| format!("Failed to open reply pipe {}", self.reply_pipe.display()))?;
        wire::read_response(&mut std::io::BufReader::new(reply))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.reply_pipe) {
            log::warn!("Failed to remove reply pipe {}: {}", self.reply_pipe.display(), e);
        }
    }
}
