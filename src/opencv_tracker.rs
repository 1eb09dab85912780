//! In-process tracking backend built on the OpenCV CSRT tracker.
//!
//! The tracker only runs forward from the seed frame, so frames before the
//! earliest seed are reported without objects. Masks are the filled tracked
//! rectangles.

use crate::error::{Error, Result};
use crate::ffmpeg_stream::{self, Frame, FrameStream, VideoInfo};
use crate::geometry::{box_to_mask, BoundingBox, Corners};
use crate::model::{ObjectMask, OffloadPolicy, Propagation, PropagationStream, TrackingModel, VideoSource};
use futures::stream;
use futures_util::StreamExt;
use log::{error, info, warn};
use opencv::video::Tracker;

pub struct OpencvTracker {
    obj: opencv::core::Ptr<dyn opencv::tracking::TrackerCSRT>,
}

impl OpencvTracker {
    pub fn new() -> Result<Self> {
        let tracker_param = opencv::tracking::TrackerCSRT_Params::default()?;
        Ok(Self {
            obj: <dyn opencv::tracking::TrackerCSRT>::create(&tracker_param)?,
        })
    }

    pub fn init(&mut self, frame: &mut Frame, init_box: opencv::core::Rect) -> Result<()> {
        let obj = &mut self.obj;
        frame.with_mat(|mat| obj.init(mat, init_box))?;
        Ok(())
    }

    /// New position on `frame`, `None` once the target is lost.
    pub fn update(&mut self, frame: &mut Frame, last_box: opencv::core::Rect) -> Result<Option<opencv::core::Rect>> {
        let obj = &mut self.obj;
        let mut bounding_box = last_box;
        let found = frame.with_mat(|mat| obj.update(mat, &mut bounding_box))?;
        Ok(found.then_some(bounding_box))
    }
}

#[derive(Default)]
pub struct CsrtModel;

struct Seed {
    frame_index: usize,
    object_id: u32,
    rect: opencv::core::Rect,
}

pub struct CsrtState {
    source: VideoSource,
    info: VideoInfo,
    seeds: Vec<Seed>,
}

struct Target {
    seed: Seed,
    tracker: Option<OpencvTracker>,
    last_box: opencv::core::Rect,
    lost: bool,
}

struct Run {
    frames: FrameStream,
    info: VideoInfo,
    targets: Vec<Target>,
}

fn to_rect(corners: Corners) -> opencv::core::Rect {
    let bbox = corners.to_box();
    opencv::core::Rect::new(bbox.x, bbox.y, bbox.width, bbox.height)
}

fn rect_mask(rect: &opencv::core::Rect, info: &VideoInfo) -> crate::geometry::Mask {
    let bbox = BoundingBox::new(rect.x, rect.y, (rect.width - 1).max(0), (rect.height - 1).max(0));
    box_to_mask(&bbox, info.dimensions.width, info.dimensions.height)
}

impl Target {
    fn step(&mut self, frame: &mut Frame, info: &VideoInfo) -> Option<ObjectMask> {
        if frame.index < self.seed.frame_index {
            return None;
        }
        let object_id = self.seed.object_id;

        if frame.index == self.seed.frame_index {
            let mut tracker = match OpencvTracker::new() {
                Ok(tracker) => tracker,
                Err(e) => {
                    error!("tracker setup failed: {e}");
                    self.lost = true;
                    return Some(ObjectMask { object_id, mask: None });
                }
            };
            if let Err(e) = tracker.init(frame, self.seed.rect) {
                error!("tracker setup failed: {e}");
                self.lost = true;
                return Some(ObjectMask { object_id, mask: None });
            }
            self.tracker = Some(tracker);
            self.last_box = self.seed.rect;
            return Some(ObjectMask {
                object_id,
                mask: Some(rect_mask(&self.last_box, info)),
            });
        }

        let Some(tracker) = self.tracker.as_mut().filter(|_| !self.lost) else {
            return Some(ObjectMask { object_id, mask: None });
        };
        match tracker.update(frame, self.last_box) {
            Ok(Some(rect)) => {
                self.last_box = rect;
                Some(ObjectMask {
                    object_id,
                    mask: Some(rect_mask(&rect, info)),
                })
            }
            Ok(None) => {
                warn!("tracking lost on frame {}", frame.index);
                self.lost = true;
                Some(ObjectMask { object_id, mask: None })
            }
            Err(e) => {
                warn!("tracker update failed on frame {}: {e}", frame.index);
                Some(ObjectMask { object_id, mask: None })
            }
        }
    }
}

impl TrackingModel for CsrtModel {
    type State = CsrtState;

    async fn init(&self, source: &VideoSource, _offload: OffloadPolicy) -> Result<CsrtState> {
        let info = ffmpeg_stream::probe_source(source)?;
        info!(
            "csrt: {} is {}x{} at {} fps",
            source.path().display(),
            info.dimensions.width,
            info.dimensions.height,
            info.rate
        );
        Ok(CsrtState {
            source: source.clone(),
            info,
            seeds: vec![],
        })
    }

    async fn seed(&self, state: &mut CsrtState, frame_index: usize, corners: Corners, object_id: u32) -> Result<()> {
        let rect = to_rect(corners);
        if rect.width <= 0 || rect.height <= 0 {
            return Err(Error::Model(format!("csrt needs a non-empty seed box, got {rect:?}")));
        }
        if let Some(count) = state.info.frame_count {
            if frame_index >= count {
                return Err(Error::Model(format!(
                    "seed frame {frame_index} is outside the video ({count} frames)"
                )));
            }
        }
        state.seeds.retain(|s| s.object_id != object_id);
        state.seeds.push(Seed {
            frame_index,
            object_id,
            rect,
        });
        Ok(())
    }

    fn propagate<'a>(&'a self, state: &'a mut CsrtState) -> PropagationStream<'a> {
        let frames = match ffmpeg_stream::open_source(&state.source) {
            Ok((_, frames)) => frames,
            Err(e) => return stream::once(async move { Err(e) }).boxed_local(),
        };
        let targets = state
            .seeds
            .drain(..)
            .map(|seed| Target {
                last_box: seed.rect,
                seed,
                tracker: None,
                lost: false,
            })
            .collect();
        let run = Run {
            frames,
            info: state.info,
            targets,
        };

        stream::unfold(run, |mut run| async move {
            let item = match run.frames.next().await? {
                Ok(mut frame) => {
                    let info = run.info;
                    let objects = run
                        .targets
                        .iter_mut()
                        .filter_map(|t| t.step(&mut frame, &info))
                        .collect();
                    Ok(Propagation {
                        frame_index: frame.index,
                        objects,
                    })
                }
                Err(e) => Err(Error::Video(format!("frame decode failed: {e}"))),
            };
            Some((item, run))
        })
        .boxed_local()
    }

    async fn release(&self, state: CsrtState) {
        info!("csrt: release {}", state.source.path().display());
        drop(state);
    }
}
