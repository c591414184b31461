use std::process::Stdio;
use std::sync::Arc;

use camstream_common::assembler::FrameAssembler;
use camstream_common::config::CameraConfig;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::splitter::MarkerSplitter;
use super::{reset_for_restart, SourceError, INITIAL_BACKOFF, MAX_BACKOFF};

/// Keep an encoder process running and feed its stdout to the assembler.
pub async fn run_command_source(camera: &CameraConfig, assembler: Arc<FrameAssembler>) {
    let args = match camera.encoder_args() {
        Ok(args) => args,
        Err(e) => {
            error!(error = %e, "cannot build encoder arguments, no frames will be produced");
            return;
        }
    };

    let mut backoff = INITIAL_BACKOFF;

    loop {
        info!(
            program = camera.program,
            args = ?args,
            resolution = camera.resolution,
            framerate = camera.framerate,
            "starting encoder"
        );
        match capture(&camera.program, &args, camera.read_chunk_size, &assembler).await {
            Ok(bytes) => {
                info!(bytes, "encoder exited cleanly, restarting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                error!(error = %e, "encoder failed, restarting in {:?}", backoff);
            }
        }
        reset_for_restart(&assembler);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Run the encoder once, until it exits. Returns the number of bytes read.
pub async fn capture(
    program: &str,
    args: &[String],
    chunk_size: usize,
    assembler: &FrameAssembler,
) -> Result<u64, SourceError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SourceError::Spawn(program.to_string(), e))?;

    let stdout = child.stdout.take().ok_or(SourceError::NoStdout)?;
    info!(program, pid = ?child.id(), "encoder running");

    let bytes = pump(stdout, chunk_size, assembler)
        .await
        .map_err(SourceError::Read)?;

    let status = child.wait().await.map_err(SourceError::Read)?;
    if !status.success() {
        return Err(SourceError::Exited(status.to_string()));
    }
    Ok(bytes)
}

/// Read `reader` to EOF, re-cutting its bytes at frame markers and handing
/// every chunk to the assembler.
pub async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    chunk_size: usize,
    assembler: &FrameAssembler,
) -> std::io::Result<u64> {
    let mut read_buf = vec![0u8; chunk_size];
    let mut splitter = MarkerSplitter::new();
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;

        for chunk in splitter.push(&read_buf[..n]) {
            assembler.ingest(&chunk);
        }
    }

    if let Some(rest) = splitter.finish() {
        assembler.ingest(&rest);
    }

    if total == 0 {
        warn!("encoder produced no output");
    } else {
        debug!(bytes = total, frames = assembler.published(), "encoder output ended");
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_publishes_complete_frames() {
        let stream: Vec<u8> = [
            &[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 0xFF, 0xD9][..],
            &[0xFF, 0xD8, 0xFF, 0xE0, 3, 4, 0xFF, 0xD9][..],
            &[0xFF, 0xD8, 0xFF, 0xE0, 5][..],
        ]
        .concat();

        let assembler = FrameAssembler::new();
        let total = pump(stream.as_slice(), 3, &assembler).await.unwrap();

        assert_eq!(total, stream.len() as u64);
        assert_eq!(assembler.published(), 2);
        assert_eq!(
            assembler.current().unwrap().data.as_ref(),
            &[0xFF, 0xD8, 0xFF, 0xE0, 3, 4, 0xFF, 0xD9]
        );
        // The last frame has no following marker and stays buffered.
        assert_eq!(assembler.buffered_len(), 5);
    }

    #[tokio::test]
    async fn empty_output_publishes_nothing() {
        let assembler = FrameAssembler::new();
        let total = pump(&b""[..], 16, &assembler).await.unwrap();
        assert_eq!(total, 0);
        assert!(assembler.current().is_none());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let assembler = FrameAssembler::new();
        let result = capture("/nonexistent/encoder", &[], 1024, &assembler).await;
        assert!(matches!(result, Err(SourceError::Spawn(..))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_process_stdout() {
        let assembler = FrameAssembler::new();
        let args = vec![
            "-c".to_string(),
            r"printf '\377\330A\377\330B\377\330C'".to_string(),
        ];
        let total = capture("sh", &args, 2, &assembler).await.unwrap();
        assert_eq!(total, 9);
        assert_eq!(assembler.published(), 2);
        assert_eq!(assembler.current().unwrap().data.as_ref(), b"\xFF\xD8B");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_process_is_reported() {
        let assembler = FrameAssembler::new();
        let args = vec!["-c".to_string(), "exit 3".to_string()];
        let result = capture("sh", &args, 16, &assembler).await;
        assert!(matches!(result, Err(SourceError::Exited(_))));
    }
}
