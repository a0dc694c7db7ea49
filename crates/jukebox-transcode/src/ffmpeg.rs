//! ffmpeg-backed [`Transcoder`].
//!
//! Spawns one ffmpeg child per track with stdout piped and copies the raw
//! PCM stream into the caller's writer in fixed-size chunks, checking the
//! cancellation token between chunks.

use std::ffi::OsString;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::{CancelToken, Profile, Transcoder};

const COPY_CHUNK: usize = 8 * 1024;

/// Transcoder that decodes through an external ffmpeg process.
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(
        &self,
        token: &CancelToken,
        profile: &Profile,
        path: &Path,
        out: &mut dyn Write,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Ok(());
        }

        tracing::debug!(?path, seek = ?profile.seek(), "spawning ffmpeg");

        let mut child = Command::new(&self.binary)
            .args(pcm_args(profile, path))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn {:?}", self.binary))?;
        let mut stdout = child.stdout.take().context("capture ffmpeg stdout")?;

        let mut chunk = [0u8; COPY_CHUNK];
        loop {
            if token.is_cancelled() {
                return reap(&mut child);
            }
            let n = match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    let _ = reap(&mut child);
                    return Err(err).context("read ffmpeg stdout");
                }
            };
            if let Err(err) = out.write_all(&chunk[..n]) {
                // BrokenPipe means the engine took the sink away (skip,
                // clear, or shutdown), possibly before this session's token
                // fires; that is a normal way to stop, not a decode failure.
                let _ = reap(&mut child);
                if token.is_cancelled() || err.kind() == ErrorKind::BrokenPipe {
                    return Ok(());
                }
                return Err(err).context("write pcm stream");
            }
        }

        let status = child.wait().context("wait for ffmpeg")?;
        if !status.success() {
            bail!("ffmpeg exited with {status}");
        }
        Ok(())
    }
}

fn pcm_args(profile: &Profile, path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostdin".into(),
    ];
    if !profile.seek().is_zero() {
        args.push("-ss".into());
        args.push(format!("{}", profile.seek().as_secs_f64()).into());
    }
    args.push("-i".into());
    args.push(path.into());
    args.push("-vn".into());
    args.push("-c:a".into());
    args.push("pcm_s16le".into());
    args.push("-ar".into());
    args.push(profile.sample_rate().to_string().into());
    args.push("-ac".into());
    args.push(profile.channels().to_string().into());
    args.push("-f".into());
    args.push("s16le".into());
    args.push("pipe:1".into());
    args
}

fn reap(child: &mut Child) -> Result<()> {
    let _ = child.kill();
    let _ = child.wait();
    Ok(())
}
