//! ffmpeg-backed HLS processor
//!
//! ffmpeg reads the video container on stdin and the audio container on fd 3,
//! which is the read end of a FIFO filled from the audio pipe. Segments and the
//! rolling manifest are written to a per-session directory removed on destroy.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::dup2;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{HlsOutput, MediaProcessor, ProcessorError, ProcessorKind};
use crate::pipe::{NamedPipe, PipeReader};

/// Descriptor number ffmpeg opens as `pipe:3`
const AUDIO_FD: RawFd = 3;

/// Relative URL prefix written in front of every segment in the manifest
pub const SEGMENT_BASE_URL: &str = "hls/";

#[derive(Debug, Clone)]
pub struct HlsSettings {
    pub ffmpeg_path: String,
    /// Target segment length in seconds
    pub hls_time: u32,
    /// Segments kept in the manifest
    pub list_size: u32,
    /// Parent of the per-session output directories
    pub base_dir: PathBuf,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            hls_time: 4,
            list_size: 8,
            base_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Clone)]
struct HlsSession {
    id: Uuid,
    dir: PathBuf,
    manifest: PathBuf,
    audio_pipe: Arc<NamedPipe>,
}

pub struct FfmpegHlsProcessor {
    settings: HlsSettings,
    session: Mutex<Option<HlsSession>>,
    kill: CancellationToken,
}

impl FfmpegHlsProcessor {
    pub fn new(settings: HlsSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
            kill: CancellationToken::new(),
        }
    }

    /// ffmpeg command line for one session
    pub fn build_args(&self, dir: &Path, manifest: &Path) -> Vec<String> {
        let segment_pattern = dir.join("%Y-%m-%d-%s.ts");
        let mut args: Vec<String> = [
            "-fflags", "nobuffer+genpts",
            "-threads", "0",
            "-re",
            "-i", "pipe:0",
            "-i", "pipe:3",
            "-loglevel", "info",
            "-c:v", "libx264",
            "-preset", "ultrafast",
            "-tune", "zerolatency",
            "-crf", "30",
            "-maxrate", "2000k",
            "-bufsize", "1500k",
            "-pix_fmt", "yuv420p",
            "-c:a", "libopus",
            "-err_detect", "ignore_err",
            "-muxdelay", "0",
            "-map_metadata", "0",
            "-copyts",
            "-copytb", "0",
            "-strftime", "1",
            "-f", "hls",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.extend([
            "-hls_time".to_string(),
            self.settings.hls_time.to_string(),
            "-hls_list_size".to_string(),
            self.settings.list_size.to_string(),
            "-hls_flags".to_string(),
            "delete_segments+independent_segments".to_string(),
            "-hls_start_number_source".to_string(),
            "datetime".to_string(),
            "-hls_allow_cache".to_string(),
            "0".to_string(),
            "-hls_base_url".to_string(),
            SEGMENT_BASE_URL.to_string(),
            "-hls_segment_filename".to_string(),
            segment_pattern.to_string_lossy().into_owned(),
            manifest.to_string_lossy().into_owned(),
        ]);
        args
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        session: &HlsSession,
        video: PipeReader,
        audio: PipeReader,
    ) -> Result<(), ProcessorError> {
        let session_id = session.id;
        // Writer first: opening the read end alone would block
        let sender = session
            .audio_pipe
            .open_sender()
            .map_err(|e| ProcessorError::NamedPipe(e.to_string()))?;
        let reader_file = session
            .audio_pipe
            .open_reader_file()
            .map_err(|e| ProcessorError::NamedPipe(e.to_string()))?;
        let reader_fd = reader_file.as_raw_fd();

        let args = self.build_args(&session.dir, &session.manifest);
        tracing::info!(
            "[{}] Starting {} {}",
            session_id,
            self.settings.ffmpeg_path,
            args.join(" ")
        );

        let mut command = Command::new(&self.settings.ffmpeg_path);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // SAFETY: only async-signal-safe fcntl/dup2 calls run between fork and exec
        unsafe {
            command.pre_exec(move || attach_audio_fd(reader_fd));
        }

        let mut child = command.spawn().map_err(|e| {
            ProcessorError::Spawn(format!("{}: {}", self.settings.ffmpeg_path, e))
        })?;
        drop(reader_file);
        tracing::info!("[{}] ffmpeg started with PID {:?}", session_id, child.id());

        let video_task = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(copy_pipe("video", video, stdin)));
        let audio_task = tokio::spawn(copy_pipe("audio", audio, sender));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            tracing::debug!(component = "ffmpeg", session = %session_id, "{}", line)
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("[{}] Error reading ffmpeg log: {}", session_id, e);
                            break;
                        }
                    }
                }
            });
        }

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
            _ = self.kill.cancelled() => None,
        };

        if let Some(task) = video_task {
            task.abort();
        }
        audio_task.abort();

        match status {
            None => {
                tracing::info!("[{}] Stopping ffmpeg", session_id);
                if let Err(e) = child.kill().await {
                    tracing::warn!("[{}] Failed to kill ffmpeg: {}", session_id, e);
                }
                Ok(())
            }
            Some(Ok(status)) if status.success() => {
                tracing::info!("[{}] ffmpeg exited", session_id);
                Ok(())
            }
            Some(Ok(status)) => Err(ProcessorError::Exit(status.to_string())),
            Some(Err(e)) => Err(ProcessorError::Io(e)),
        }
    }

    fn end_session(&self) -> Option<HlsSession> {
        self.kill.cancel();
        let session = self.session.lock().take()?;
        tracing::info!("[{}] Removing {}", session.id, session.dir.display());
        if let Err(e) = session.audio_pipe.close() {
            tracing::warn!("[{}] Failed to close audio pipe: {}", session.id, e);
        }
        Some(session)
    }

    /// Like `destroy`, but returns once the output directory is gone
    async fn finish(&self) {
        if let Some(session) = self.end_session() {
            remove_dir_blocking(session.dir).await;
        }
    }
}

#[async_trait]
impl MediaProcessor for FfmpegHlsProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Hls
    }

    async fn transcode(
        &self,
        cancel: CancellationToken,
        video: PipeReader,
        audio: PipeReader,
    ) -> Result<(), ProcessorError> {
        if self.kill.is_cancelled() {
            return Err(ProcessorError::Spawn("processor already destroyed".to_string()));
        }

        let id = Uuid::new_v4();
        let dir = self.settings.base_dir.join(format!("{}-hls", id));
        tokio::fs::create_dir_all(&dir).await?;
        let manifest = dir.join(format!("{}.m3u8", Uuid::new_v4()));
        tracing::info!("[{}] HLS output directory {}", id, dir.display());

        let audio_pipe = match NamedPipe::create(&dir, "audio") {
            Ok(pipe) => Arc::new(pipe),
            Err(e) => {
                remove_dir_blocking(dir).await;
                return Err(ProcessorError::NamedPipe(e.to_string()));
            }
        };

        let session = HlsSession {
            id,
            dir,
            manifest,
            audio_pipe,
        };
        *self.session.lock() = Some(session.clone());
        if self.kill.is_cancelled() {
            // Destroyed while setting up
            self.finish().await;
            return Ok(());
        }

        let result = self.run(cancel, &session, video, audio).await;
        if let Err(e) = &result {
            tracing::error!("[{}] HLS transcoder failed: {}", id, e);
        }
        self.finish().await;
        result
    }

    /// Kill the transcoder and drop the session.
    ///
    /// Callers may hold locks, so the output directory is removed on the
    /// blocking pool when a runtime is available.
    fn destroy(&self) {
        let Some(session) = self.end_session() else {
            return;
        };
        let dir = session.dir;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_dir(&dir));
            }
            Err(_) => remove_dir(&dir),
        }
    }

    fn hls_output(&self) -> Option<HlsOutput> {
        self.session.lock().as_ref().map(|s| HlsOutput {
            dir: s.dir.clone(),
            manifest: s.manifest.clone(),
        })
    }
}

/// Make `fd` available as [`AUDIO_FD`] in the child, without close-on-exec
fn attach_audio_fd(fd: RawFd) -> io::Result<()> {
    if fd == AUDIO_FD {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        dup2(fd, AUDIO_FD)?;
    }
    Ok(())
}

async fn copy_pipe<W: AsyncWrite + Unpin>(name: &str, mut reader: PipeReader, mut writer: W) -> u64 {
    let mut copied = 0u64;
    loop {
        let chunk = match reader.read_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("{} input closed: {}", name, e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&chunk).await {
            tracing::debug!("{} output closed: {}", name, e);
            break;
        }
        copied += chunk.len() as u64;
    }
    let _ = writer.shutdown().await;
    tracing::debug!("{} copy finished after {} bytes", name, copied);
    copied
}

fn remove_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", dir.display(), e),
    }
}

async fn remove_dir_blocking(dir: PathBuf) {
    if let Err(e) = tokio::task::spawn_blocking(move || remove_dir(&dir)).await {
        tracing::warn!("Output directory removal task failed: {}", e);
    }
}
