#![allow(dead_code)]

use boxtrack::annotation::Annotation;
use boxtrack::geometry::{box_to_mask, BoundingBox, Corners};
use boxtrack::model::{ObjectMask, OffloadPolicy, Propagation, PropagationStream, TrackingModel, VideoSource};
use boxtrack::{Error, Result};
use futures::stream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const FRAME_WIDTH: u32 = 256;
pub const FRAME_HEIGHT: u32 = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Init(String),
    Seed {
        video: String,
        frame: usize,
        corners: Corners,
        object_id: u32,
    },
    Propagate(String),
    Release(String),
}

/// What the fake reports for one video.
#[derive(Debug, Clone)]
pub struct FakeVideo {
    pub frames: usize,
    /// Object position on every frame, `None` for a lost object.
    pub object: Option<BoundingBox>,
    /// Fail the pass after this many frames.
    pub fail_after: Option<usize>,
    pub fail_init: bool,
}

impl FakeVideo {
    pub fn still(frames: usize, object: BoundingBox) -> Self {
        Self {
            frames,
            object: Some(object),
            fail_after: None,
            fail_init: false,
        }
    }

    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

pub struct FakeState {
    video: String,
    seeds: Vec<(usize, u32)>,
}

/// Deterministic stand-in for a segmentation model.
#[derive(Default, Clone)]
pub struct FakeModel {
    videos: HashMap<String, FakeVideo>,
    calls: Arc<Mutex<Vec<Call>>>,
    cancel_on: Option<(usize, CancellationToken)>,
}

impl FakeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(mut self, video_id: &str, video: FakeVideo) -> Self {
        self.videos.insert(video_id.to_string(), video);
        self
    }

    /// Cancels `token` while `frame` is handed out.
    pub fn cancel_on(mut self, frame: usize, token: CancellationToken) -> Self {
        self.cancel_on = Some((frame, token));
        self
    }

    pub fn call_log(&self) -> Arc<Mutex<Vec<Call>>> {
        self.calls.clone()
    }

    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn video_id(source: &VideoSource) -> String {
    source.path().to_string_lossy().into_owned()
}

impl TrackingModel for FakeModel {
    type State = FakeState;

    async fn init(&self, source: &VideoSource, _offload: OffloadPolicy) -> Result<FakeState> {
        let video = video_id(source);
        self.log(Call::Init(video.clone()));
        match self.videos.get(&video) {
            Some(v) if v.fail_init => Err(Error::Video(format!("cannot open {video}"))),
            Some(_) => Ok(FakeState { video, seeds: vec![] }),
            None => Err(Error::Video(format!("{video} not found"))),
        }
    }

    async fn seed(&self, state: &mut FakeState, frame_index: usize, corners: Corners, object_id: u32) -> Result<()> {
        self.log(Call::Seed {
            video: state.video.clone(),
            frame: frame_index,
            corners,
            object_id,
        });
        state.seeds.push((frame_index, object_id));
        Ok(())
    }

    fn propagate<'a>(&'a self, state: &'a mut FakeState) -> PropagationStream<'a> {
        self.log(Call::Propagate(state.video.clone()));
        let video = self.videos[&state.video].clone();
        let object_ids: Vec<u32> = state.seeds.iter().map(|(_, id)| *id).collect();
        let cancel_on = self.cancel_on.clone();

        let mut items: Vec<Result<Propagation>> = (0..video.frames)
            .map(|frame_index| {
                let objects = object_ids
                    .iter()
                    .map(|&object_id| ObjectMask {
                        object_id,
                        mask: video.object.map(|b| box_to_mask(&b, FRAME_WIDTH, FRAME_HEIGHT)),
                    })
                    .collect();
                Ok(Propagation { frame_index, objects })
            })
            .collect();
        if let Some(n) = video.fail_after {
            items.truncate(n);
            items.push(Err(Error::Model("CUDA out of memory".into())));
        }

        stream::iter(items)
            .inspect(move |item| {
                if let (Ok(p), Some((frame, token))) = (item, &cancel_on) {
                    if p.frame_index == *frame {
                        token.cancel();
                    }
                }
            })
            .boxed_local()
    }

    async fn release(&self, state: FakeState) {
        self.log(Call::Release(state.video));
    }
}

pub fn annotation(video_id: &str, frame_index: usize, bbox: BoundingBox) -> Annotation {
    Annotation::new(video_id, frame_index, bbox)
}
