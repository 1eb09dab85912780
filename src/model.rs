//! Interface to the segmentation/tracking model.
//!
//! A model handle is created once per batch and shared read-only between
//! videos. Everything that belongs to one video lives in the model's
//! [`TrackingModel::State`], which the session driver owns from `init` until
//! `release`.

use crate::error::{Error, Result};
use crate::geometry::{Corners, Mask};
use futures::stream::LocalBoxStream;
use std::path::{Path, PathBuf};

pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// Where the frames of a video come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    File(PathBuf),
    /// Directory of extracted frames, one image per frame.
    Frames(PathBuf),
}

impl VideoSource {
    pub fn resolve(video_path: &str) -> Result<Self> {
        let path = Path::new(video_path);
        if path.is_dir() {
            return Ok(VideoSource::Frames(path.to_path_buf()));
        }
        let is_video = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_video {
            Ok(VideoSource::File(path.to_path_buf()))
        } else {
            Err(Error::Configuration(format!(
                "invalid video source '{video_path}': expected a video file ({}) or a directory of frames",
                VIDEO_EXTENSIONS.join(", ")
            )))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            VideoSource::File(p) | VideoSource::Frames(p) => p,
        }
    }
}

/// Where the model keeps per-video buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadPolicy {
    pub offload_video_to_cpu: bool,
    pub offload_state_to_cpu: bool,
}

impl Default for OffloadPolicy {
    fn default() -> Self {
        Self {
            offload_video_to_cpu: true,
            offload_state_to_cpu: false,
        }
    }
}

/// Mask of one object on one frame. `mask` is `None` when the model could
/// not produce one (lost object, undecodable frame).
#[derive(Debug, Clone)]
pub struct ObjectMask {
    pub object_id: u32,
    pub mask: Option<Mask>,
}

/// Everything the model reports for one frame.
#[derive(Debug, Clone)]
pub struct Propagation {
    pub frame_index: usize,
    pub objects: Vec<ObjectMask>,
}

pub type PropagationStream<'a> = LocalBoxStream<'a, Result<Propagation>>;

#[allow(async_fn_in_trait)]
pub trait TrackingModel {
    type State;

    /// Loads `source` and allocates the per-video state.
    async fn init(&self, source: &VideoSource, offload: OffloadPolicy) -> Result<Self::State>;

    /// Registers `corners` as the position of `object_id` on `frame_index`.
    async fn seed(
        &self,
        state: &mut Self::State,
        frame_index: usize,
        corners: Corners,
        object_id: u32,
    ) -> Result<()>;

    /// One forward pass over the whole video, starting at frame 0 with
    /// strictly increasing frame indices. Not restartable.
    fn propagate<'a>(&'a self, state: &'a mut Self::State) -> PropagationStream<'a>;

    /// Frees the per-video state. Must not fail.
    async fn release(&self, state: Self::State);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_file_extensions_resolve() {
        assert_eq!(
            VideoSource::resolve("vids/fastjet1.mp4").unwrap(),
            VideoSource::File(PathBuf::from("vids/fastjet1.mp4"))
        );
        assert!(matches!(
            VideoSource::resolve("clip.MOV").unwrap(),
            VideoSource::File(_)
        ));
    }

    #[test]
    fn directories_are_frame_sources() {
        let dir = tempdir::TempDir::new("boxtrack-frames").unwrap();
        let source = VideoSource::resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(source, VideoSource::Frames(dir.path().to_path_buf()));
    }

    #[test]
    fn other_paths_are_configuration_errors() {
        let err = VideoSource::resolve("notes.txt").unwrap_err();
        assert!(err.is_fatal());
        assert!(VideoSource::resolve("no_extension").is_err());
    }
}
