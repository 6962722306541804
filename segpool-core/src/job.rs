//! Job configuration and encode parameters: what `/config` and
//! `/metadata/source.json` hold, and how a worker resolves the parameters
//! for one assignment.

use serde::{Deserialize, Serialize};

/// Default video bitrate in kbit/s, applied when an assignment carries no
/// encode options.
pub const DEFAULT_BITRATE_KBPS: u64 = 200_000;

/// Encode parameters, set once per pool and applied to every assignment.
/// Carried verbatim in the `request-work` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeOpts {
    /// Target video bitrate in kbit/s.
    pub bitrate: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Frame rate as an ffprobe rational, e.g. "30000/1001".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

impl EncodeOpts {
    /// Build pool-wide options from probed source metadata plus operator
    /// bitrate/level flags.
    pub fn from_source(meta: &SourceMeta, bitrate: u64, level: Option<f64>) -> Result<Self, JobError> {
        let video = meta.video.first().ok_or(JobError::NoVideoStream)?;
        Ok(EncodeOpts {
            bitrate,
            level,
            width: video.width,
            height: video.height,
            fps: video.r_frame_rate.clone(),
            profile: video.profile.clone(),
        })
    }
}

/// Effective parameters for one assignment: options supplied in the reply if
/// present, otherwise frame rate from the pool's source metadata and the
/// fixed default bitrate.
pub fn resolve_encode_opts(assigned: Option<EncodeOpts>, source: Option<&SourceMeta>) -> EncodeOpts {
    if let Some(opts) = assigned {
        return opts;
    }
    EncodeOpts {
        bitrate: DEFAULT_BITRATE_KBPS,
        level: None,
        width: None,
        height: None,
        fps: source
            .and_then(|m| m.video.first())
            .and_then(|v| v.r_frame_rate.clone()),
        profile: None,
    }
}

/// Subset of probed source metadata the coordination layer reads. The
/// document is ffprobe output written by job setup; field names follow
/// ffprobe, and anything else in the file is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMeta {
    #[serde(default)]
    pub video: Vec<VideoStream>,
    #[serde(default)]
    pub tracks: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoStream {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub r_frame_rate: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
}

impl SourceMeta {
    /// Frame rate of the first video stream as a float, rounded to three
    /// decimals (so 30000/1001 reads back as 29.97).
    pub fn fps(&self) -> Result<f64, JobError> {
        let rate = self
            .video
            .first()
            .and_then(|v| v.r_frame_rate.as_deref())
            .ok_or(JobError::NoVideoStream)?;
        parse_frame_rate(rate)
    }
}

/// Parse an ffprobe rational ("num/den") or plain number into frames/second.
pub fn parse_frame_rate(rate: &str) -> Result<f64, JobError> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().map_err(|_| JobError::BadFrameRate(rate.into()))?;
            let den: f64 = den.trim().parse().map_err(|_| JobError::BadFrameRate(rate.into()))?;
            if den == 0.0 {
                return Err(JobError::BadFrameRate(rate.into()));
            }
            num / den
        }
        None => rate
            .trim()
            .parse()
            .map_err(|_| JobError::BadFrameRate(rate.into()))?,
    };
    Ok((fps * 1000.0).round() / 1000.0)
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("source metadata has no video stream")]
    NoVideoStream,
    #[error("bad frame rate: {0}")]
    BadFrameRate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(rate: &str) -> SourceMeta {
        SourceMeta {
            video: vec![VideoStream {
                width: Some(1920),
                height: Some(1080),
                r_frame_rate: Some(rate.to_string()),
                profile: Some("High".to_string()),
            }],
            tracks: vec![],
        }
    }

    #[test]
    fn frame_rate_rational() {
        assert_eq!(parse_frame_rate("30000/1001").unwrap(), 29.97);
        assert_eq!(parse_frame_rate("25/1").unwrap(), 25.0);
        assert_eq!(parse_frame_rate("24").unwrap(), 24.0);
    }

    #[test]
    fn frame_rate_rejects_garbage() {
        assert!(parse_frame_rate("abc").is_err());
        assert!(parse_frame_rate("30/0").is_err());
    }

    #[test]
    fn resolve_prefers_assignment_opts() {
        let assigned = EncodeOpts {
            bitrate: 5_000,
            level: Some(5.1),
            width: None,
            height: None,
            fps: Some("25/1".into()),
            profile: None,
        };
        let resolved = resolve_encode_opts(Some(assigned.clone()), Some(&meta("30/1")));
        assert_eq!(resolved, assigned);
    }

    #[test]
    fn resolve_falls_back_to_source_fps_and_default_bitrate() {
        let resolved = resolve_encode_opts(None, Some(&meta("30000/1001")));
        assert_eq!(resolved.bitrate, DEFAULT_BITRATE_KBPS);
        assert_eq!(resolved.fps.as_deref(), Some("30000/1001"));
        assert_eq!(resolved.width, None);
    }

    #[test]
    fn resolve_without_metadata_still_has_bitrate() {
        let resolved = resolve_encode_opts(None, None);
        assert_eq!(resolved.bitrate, DEFAULT_BITRATE_KBPS);
        assert_eq!(resolved.fps, None);
    }

    #[test]
    fn from_source_copies_video_fields() {
        let opts = EncodeOpts::from_source(&meta("30000/1001"), 8_000, Some(5.1)).unwrap();
        assert_eq!(opts.bitrate, 8_000);
        assert_eq!(opts.width, Some(1920));
        assert_eq!(opts.profile.as_deref(), Some("High"));
    }

    #[test]
    fn from_source_requires_video_stream() {
        let empty = SourceMeta::default();
        assert!(matches!(
            EncodeOpts::from_source(&empty, 8_000, None),
            Err(JobError::NoVideoStream)
        ));
    }

    #[test]
    fn source_meta_ignores_extra_ffprobe_fields() {
        let json = r#"{
            "format": {"duration": "600.0", "format_name": "mov,mp4"},
            "video": [{"width": 1280, "height": 720, "r_frame_rate": "24/1",
                       "codec_name": "h264", "pix_fmt": "yuv420p"}],
            "tracks": [{"index": 1, "codec_type": "audio"}]
        }"#;
        let meta: SourceMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.fps().unwrap(), 24.0);
        assert_eq!(meta.tracks.len(), 1);
    }
}
