//! Finalization: concatenate completed segment outputs in name order into a
//! single elementary stream, then mux it with the job's extracted tracks
//! into an mp4 container.

use std::path::Path;
use std::process::Stdio;

use segpool_core::paths;
use tokio::process::Command;
use tracing::{debug, info};

use crate::store::{Store, StoreError};
use crate::util::epoch;

/// Finalization seam used by the pool's completion check. Returns the drive
/// path of the finished artifact.
pub trait Finalizer: Send + Sync {
    fn finalize(
        &self,
        store: &Store,
        tracks: &[String],
    ) -> impl std::future::Future<Output = Result<String, FinalizeError>> + Send;
}

/// Concatenate every `.264` file under `dir` in ascending name order into
/// `/outputs/concats/concat_<epoch>.264`. Returns the written drive path.
pub async fn concat(store: &Store, dir: &str) -> Result<String, FinalizeError> {
    let mut names: Vec<String> = store
        .list(dir)
        .await?
        .into_iter()
        .filter(|n| n.ends_with(".264"))
        .collect();
    if names.is_empty() {
        return Err(FinalizeError::NoSegments(dir.to_string()));
    }
    names.sort();

    let mut joined = Vec::new();
    for name in &names {
        let bytes = store.get(&paths::join(dir, name)).await?;
        joined.extend_from_slice(&bytes);
    }
    let out = paths::join(paths::OUTPUTS_CONCATS, &format!("concat_{}.264", epoch()));
    store.put(&out, &joined).await?;
    info!(segments = names.len(), path = %out, "segments concatenated");
    Ok(out)
}

/// ffmpeg-backed finalizer: concat, then mux with the track files listed in
/// the job config. Scratch files go to a throwaway directory under the
/// system temp dir since ffmpeg needs seekable inputs for muxing.
pub struct FfmpegFinalizer {
    bin: String,
}

impl FfmpegFinalizer {
    pub fn new(bin: impl Into<String>) -> Self {
        FfmpegFinalizer { bin: bin.into() }
    }

    /// Mux a concatenated stream with the given track drive paths. Returns
    /// the drive path of the mp4.
    pub async fn mux(
        &self,
        store: &Store,
        concat_path: &str,
        tracks: &[String],
    ) -> Result<String, FinalizeError> {
        let scratch = std::env::temp_dir().join(format!("segpool-mux-{}", epoch()));
        tokio::fs::create_dir_all(&scratch).await.map_err(FinalizeError::Scratch)?;
        let result = self.mux_in(store, concat_path, tracks, &scratch).await;
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        result
    }

    async fn mux_in(
        &self,
        store: &Store,
        concat_path: &str,
        tracks: &[String],
        scratch: &Path,
    ) -> Result<String, FinalizeError> {
        let video_local = scratch.join(paths::basename(concat_path));
        tokio::fs::write(&video_local, store.get(concat_path).await?)
            .await
            .map_err(FinalizeError::Scratch)?;

        let mut track_locals = Vec::new();
        for track in tracks {
            let local = scratch.join(paths::basename(track));
            tokio::fs::write(&local, store.get(track).await?)
                .await
                .map_err(FinalizeError::Scratch)?;
            track_locals.push(local);
        }

        let stem = paths::basename(concat_path)
            .strip_suffix(".264")
            .unwrap_or_else(|| paths::basename(concat_path))
            .to_string();
        let out_local = scratch.join(format!("{stem}.mp4"));

        let mut cmd = Command::new(&self.bin);
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        cmd.args(["-f", "h264", "-i"]);
        cmd.arg(&video_local);
        for local in &track_locals {
            cmd.arg("-i");
            cmd.arg(local);
        }
        cmd.args(["-c", "copy", "-movflags", "+faststart"]);
        cmd.arg(&out_local);
        debug!(bin = %self.bin, "spawning muxer");
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(FinalizeError::Scratch)?;
        if !output.status.success() {
            return Err(FinalizeError::Mux {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mp4 = tokio::fs::read(&out_local).await.map_err(FinalizeError::Scratch)?;
        let out = paths::join(paths::OUTPUTS_MUXES, &format!("{stem}.mp4"));
        store.put(&out, &mp4).await?;
        info!(path = %out, "final mux written");
        Ok(out)
    }
}

impl Finalizer for FfmpegFinalizer {
    async fn finalize(&self, store: &Store, tracks: &[String]) -> Result<String, FinalizeError> {
        let concat_path = concat(store, paths::SEGMENTS_OUT).await?;
        self.mux(store, &concat_path, tracks).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("no segment outputs under {0}")]
    NoSegments(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("scratch io error: {0}")]
    Scratch(std::io::Error),
    #[error("muxer exited with {code:?}: {stderr}")]
    Mux { code: Option<i32>, stderr: String },
}
