//! Drive path layout shared between a pool and all of its workers. All paths
//! are absolute from the drive root; directories are implicit.

/// Job configuration area.
pub const CONFIG: &str = "/config";
/// Demuxed track list, written by job setup.
pub const TRACKS_CONFIG: &str = "/config/tracks.json";
/// Segment path list, written by job setup.
pub const SEGMENTS_CONFIG: &str = "/config/segments.json";
/// Probed source metadata (fps, resolution, duration, ...).
pub const SOURCE_META: &str = "/metadata/source.json";
/// Pre-encode segments (canonical drive only).
pub const SEGMENTS_IN: &str = "/segments/inputs";
/// Encoded segments (canonical and worker drives).
pub const SEGMENTS_OUT: &str = "/segments/outputs";
/// Demuxed non-video source tracks.
pub const TRACKS_IN: &str = "/tracks/inputs";
pub const TRACKS_OUT: &str = "/tracks/outputs";
/// Concatenated segment bitstreams.
pub const OUTPUTS_CONCATS: &str = "/outputs/concats";
/// Final muxed artifacts.
pub const OUTPUTS_MUXES: &str = "/outputs/muxes";
/// Profile marker, "pool" or "work", written once at drive creation.
pub const PROFILE: &str = "/segpool-profile";

/// Final path component. The basename is the cross-drive join key: a worker's
/// output is matched to the pool's expected segment by basename alone.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Deterministic output path for an input segment, keyed by basename.
pub fn output_path(input: &str) -> String {
    join(SEGMENTS_OUT, basename(input))
}

/// Join a drive directory and an entry name.
pub fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}
