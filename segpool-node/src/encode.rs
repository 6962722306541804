//! Segment encoding through ffmpeg. Raw H.264 elementary-stream bytes in,
//! re-encoded elementary-stream bytes out, piped through stdin/stdout so no
//! scratch files touch the drive tree.

use std::process::Stdio;

use segpool_core::EncodeOpts;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

const STDERR_TAIL: usize = 2048;

/// Encoding seam: the work loop only needs bytes in, bytes out. Implemented
/// by `FfmpegEncoder` in production and by scripted fakes in tests.
pub trait Encoder: Send + Sync {
    fn encode(
        &self,
        input: &[u8],
        opts: &EncodeOpts,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, EncodeError>> + Send;
}

pub struct FfmpegEncoder {
    bin: String,
}

impl FfmpegEncoder {
    pub fn new(bin: impl Into<String>) -> Self {
        FfmpegEncoder { bin: bin.into() }
    }
}

/// Build the argument list for one segment encode. Split out so the mapping
/// from options to flags is testable without spawning anything.
pub fn ffmpeg_args(opts: &EncodeOpts) -> Result<Vec<String>, EncodeError> {
    if opts.bitrate == 0 {
        return Err(EncodeError::MissingOpts("bitrate"));
    }
    let fps = opts
        .fps
        .as_deref()
        .ok_or(EncodeError::MissingOpts("fps"))?;

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "h264".into(),
        "-framerate".into(),
        fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-b:v".into(),
        format!("{}k", opts.bitrate),
        "-r".into(),
        fps.to_string(),
    ];
    if let (Some(w), Some(h)) = (opts.width, opts.height) {
        args.push("-vf".into());
        args.push(format!("scale={w}:{h}"));
    }
    if let Some(level) = opts.level {
        args.push("-level".into());
        args.push(level.to_string());
    }
    if let Some(profile) = &opts.profile {
        args.push("-profile:v".into());
        args.push(profile.clone());
    }
    args.push("-f".into());
    args.push("h264".into());
    args.push("pipe:1".into());
    Ok(args)
}

impl Encoder for FfmpegEncoder {
    async fn encode(&self, input: &[u8], opts: &EncodeOpts) -> Result<Vec<u8>, EncodeError> {
        let args = ffmpeg_args(opts)?;
        debug!(bin = %self.bin, ?args, "spawning encoder");
        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or(EncodeError::NoPipe)?;
        let mut stdout = child.stdout.take().ok_or(EncodeError::NoPipe)?;
        let mut stderr = child.stderr.take().ok_or(EncodeError::NoPipe)?;

        // Feed input from its own task so a full stdout pipe cannot deadlock
        // against a full stdin pipe.
        let input = input.to_vec();
        let feeder = tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });

        let mut out = Vec::new();
        let mut err_text = String::new();
        let (read_out, read_err) = tokio::join!(
            stdout.read_to_end(&mut out),
            stderr.read_to_string(&mut err_text)
        );
        read_out?;
        read_err?;
        let status = child.wait().await?;
        let _ = feeder.await;

        if !status.success() {
            let tail = err_text
                .char_indices()
                .rev()
                .nth(STDERR_TAIL.saturating_sub(1))
                .map(|(i, _)| &err_text[i..])
                .unwrap_or(&err_text);
            return Err(EncodeError::Failed {
                code: status.code(),
                stderr: tail.trim().to_string(),
            });
        }
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("missing encode option: {0}")]
    MissingOpts(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoder pipe unavailable")]
    NoPipe,
    #[error("encoder exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(bitrate: u64, fps: Option<&str>) -> EncodeOpts {
        EncodeOpts {
            bitrate,
            level: None,
            width: None,
            height: None,
            fps: fps.map(str::to_string),
            profile: None,
        }
    }

    #[test]
    fn args_require_bitrate_and_fps() {
        assert!(matches!(
            ffmpeg_args(&opts(0, Some("24"))),
            Err(EncodeError::MissingOpts("bitrate"))
        ));
        assert!(matches!(
            ffmpeg_args(&opts(200_000, None)),
            Err(EncodeError::MissingOpts("fps"))
        ));
    }

    #[test]
    fn args_map_options_to_flags() {
        let mut o = opts(200_000, Some("23.976"));
        o.width = Some(1280);
        o.height = Some(720);
        o.level = Some(4.1);
        let args = ffmpeg_args(&o).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-framerate 23.976"));
        assert!(joined.contains("-b:v 200000k"));
        assert!(joined.contains("-r 23.976"));
        assert!(joined.contains("scale=1280:720"));
        assert!(joined.contains("-level 4.1"));
        assert!(joined.ends_with("-f h264 pipe:1"));
    }

    #[tokio::test]
    async fn passthrough_command_roundtrips_bytes() {
        // Any stdin-to-stdout filter satisfies the spawn contract.
        let encoder = FfmpegEncoder::new("cat");
        let out = encoder
            .encode(b"raw bytes", &opts(200_000, Some("24")))
            .await;
        // cat ignores the flags on some platforms and errors on others;
        // accept either as long as nothing hangs.
        match out {
            Ok(_) | Err(EncodeError::Failed { .. }) | Err(EncodeError::Io(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
