//! Audio input stream: spawns a PCM producer helper, waits for its `READY`
//! line on stderr, then decodes length-prefixed PCM frames off stdout into
//! timestamped chunks.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::audio::buffer::TimestampedChunk;
use crate::error::AudioError;

/// A length-prefixed frame larger than this is treated as a protocol error
/// rather than buffered.
const MAX_FRAME_BYTES: u32 = 1024 * 1024;

const READY_LINE: &str = "READY";

pub struct AudioInputStream {
    child: tokio::process::Child,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl AudioInputStream {
    /// Spawn the producer and block until it signals `READY` on stderr.
    pub async fn spawn(
        program: &Path,
        args: &[String],
        ready_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<TimestampedChunk>), AudioError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = BufReader::new(child.stderr.take().expect("piped stderr"));

        wait_for_ready(&mut stderr, ready_timeout).await?;
        tokio::spawn(drain_stderr(stderr));

        let (tx, rx) = mpsc::channel(64);
        let stream_start = Instant::now();
        let reader_handle = tokio::spawn(read_frames(stdout, tx, stream_start));

        Ok((Self { child, reader_handle }, rx))
    }

    /// Stop the producer: SIGTERM on Unix, a plain kill elsewhere.
    pub async fn stop(mut self) {
        self.reader_handle.abort();
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
        let _ = self.child.wait().await;
    }
}

async fn wait_for_ready<R: tokio::io::AsyncBufRead + Unpin>(
    stderr: &mut R,
    ready_timeout: Duration,
) -> Result<(), AudioError> {
    let mut line = String::new();
    let read = timeout(ready_timeout, stderr.read_line(&mut line)).await;
    match read {
        Ok(Ok(0)) => Err(AudioError::ProducerExited),
        Ok(Ok(_)) if line.trim() == READY_LINE => Ok(()),
        Ok(Ok(_)) => {
            warn!(line = %line.trim(), "unexpected line before READY");
            Err(AudioError::ProducerExited)
        }
        Ok(Err(e)) => Err(AudioError::Io(e)),
        Err(_) => Err(AudioError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "producer did not signal READY in time",
        ))),
    }
}

async fn drain_stderr(mut stderr: BufReader<tokio::process::ChildStderr>) {
    let mut line = String::new();
    loop {
        line.clear();
        match stderr.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => debug!("producer: {}", line.trim()),
        }
    }
}

async fn read_frames(
    mut stdout: tokio::process::ChildStdout,
    tx: mpsc::Sender<TimestampedChunk>,
    stream_start: Instant,
) {
    let mut len_buf = [0u8; 4];
    loop {
        if stdout.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_BYTES || len % 2 != 0 {
            warn!(len, "producer frame length out of bounds, aborting stream");
            break;
        }

        let mut payload = vec![0u8; len as usize];
        if stdout.read_exact(&mut payload).await.is_err() {
            break;
        }

        let samples: Vec<i16> = payload
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let timestamp_ms = stream_start.elapsed().as_millis() as u64;

        if tx
            .send(TimestampedChunk { samples, timestamp_ms })
            .await
            .is_err()
        {
            break;
        }
    }
}
