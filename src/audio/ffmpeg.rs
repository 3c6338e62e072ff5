//! External encoder discovery and process handling.
//!
//! [`FfmpegProcess`] owns the child for its whole lifetime: it is spawned
//! with `kill_on_drop`, so any early return (a failed write, a cancelled
//! future) terminates and reaps the encoder instead of leaking it.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::encoder::OutputFormat;

const FFMPEG_NAMES: &[&str] = &["ffmpeg", "ffmpeg.exe"];
const BUNDLED_DIR: &str = "third_party/ffmpeg/bin";

/// Bytes of encoder stderr kept for error messages.
const STDERR_TAIL: usize = 16 * 1024;

/// Search `PATH` for an executable file called `name`.
pub fn search_path(name: &OsStr) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Resolve a program given either as a path or as a bare name on `PATH`.
pub fn resolve_executable(program: &Path) -> Option<PathBuf> {
    if program.is_absolute() || program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    search_path(program.as_os_str())
}

fn bundled_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        roots.extend(exe.ancestors().skip(1).map(Path::to_path_buf));
    }
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    roots
}

/// Locate the encoder binary.
///
/// An explicit path wins and is never second-guessed: if it does not exist
/// the encoder counts as unavailable.
pub fn find_ffmpeg(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        let found = path.is_file().then(|| path.to_path_buf());
        if found.is_none() {
            debug!(path = %path.display(), "configured ffmpeg path does not exist");
        }
        return found;
    }

    for name in FFMPEG_NAMES {
        if let Some(found) = search_path(OsStr::new(name)) {
            return Some(found);
        }
    }

    bundled_roots().into_iter().find_map(|root| {
        FFMPEG_NAMES
            .iter()
            .map(|name| root.join(BUNDLED_DIR).join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Where the encoder reads its audio from.
#[derive(Debug, Clone, Copy)]
pub enum FfmpegInput<'a> {
    /// Raw s16le PCM on stdin.
    RawPcm { sample_rate: u32, channels: u16 },
    /// A file readable by ffmpeg (the concatenated WAV).
    File(&'a Path),
}

/// Full argument list for one encode.
pub fn encode_args(
    input: FfmpegInput<'_>,
    format: OutputFormat,
    bitrate: &str,
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error"]
        .into_iter()
        .map(OsString::from)
        .collect();

    match input {
        FfmpegInput::RawPcm {
            sample_rate,
            channels,
        } => {
            args.extend(
                [
                    "-f".to_string(),
                    "s16le".to_string(),
                    "-ar".to_string(),
                    sample_rate.to_string(),
                    "-ac".to_string(),
                    channels.to_string(),
                    "-i".to_string(),
                    "pipe:0".to_string(),
                ]
                .map(OsString::from),
            );
        }
        FfmpegInput::File(path) => {
            args.push("-i".into());
            args.push(path.as_os_str().to_owned());
        }
    }

    args.extend(format.extra_args().iter().map(OsString::from));
    if let Some(codec) = format.codec() {
        args.extend(["-c:a", codec, "-b:a", bitrate].map(OsString::from));
    }
    args.push(output.as_os_str().to_owned());
    args
}

/// Read `reader` to the end, keeping only the last `limit` bytes.
async fn drain_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
        }
    }
    tail
}

/// A running encoder process.
///
/// Stderr is drained continuously on a separate task so a chatty encoder
/// never blocks on a full pipe while we are still feeding stdin.
pub struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    bytes_written: u64,
}

impl FfmpegProcess {
    /// Spawn the encoder. Stdin is piped only for [`FfmpegInput::RawPcm`].
    pub fn spawn(ffmpeg: &Path, args: &[OsString], pipe_stdin: bool) -> Result<Self> {
        debug!(ffmpeg = %ffmpeg.display(), ?args, "spawning encoder");
        let mut child = Command::new(ffmpeg)
            .args(args)
            .stdin(if pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", ffmpeg.display()))?;
        let stdin = child.stdin.take();
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain_tail(err, STDERR_TAIL)));
        Ok(Self {
            child,
            stdin,
            stderr,
            bytes_written: 0,
        })
    }

    /// Feed one chunk of PCM.
    pub async fn write_pcm(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder input is not a pipe"))?;
        stdin
            .write_all(bytes)
            .await
            .context("encoder closed its input early")?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Close the input and wait for a successful exit.
    pub async fn finish(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().await.ok();
            // dropping stdin delivers EOF
        }
        let bytes_written = self.bytes_written;
        let status = self
            .child
            .wait()
            .await
            .context("failed waiting for encoder")?;
        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if !status.success() {
            bail!(
                "encoder exited with {}: {}",
                status,
                String::from_utf8_lossy(&stderr).trim()
            );
        }
        info!(bytes_written, "encoder finished");
        Ok(())
    }
}

/// Run one file-to-file conversion pass.
pub async fn convert(
    ffmpeg: &Path,
    input: &Path,
    format: OutputFormat,
    bitrate: &str,
    output: &Path,
) -> Result<()> {
    let args = encode_args(FfmpegInput::File(input), format, bitrate, output);
    FfmpegProcess::spawn(ffmpeg, &args, false)?.finish().await
}
