//! Tracking backend that drives a SAM2 video predictor living in a separate
//! worker process.
//!
//! The worker is started once per batch and warmed up before the first video.
//! Requests and replies are JSON objects, one per line, on the worker's
//! stdin/stdout. The worker's stderr is passed through untouched.

use crate::error::{Error, Result};
use crate::geometry::{Corners, Mask};
use crate::model::{ObjectMask, OffloadPolicy, Propagation, PropagationStream, TrackingModel, VideoSource};
use futures::stream;
use futures_util::StreamExt;
use image::Luma;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, MutexGuard};

const CONFIG_DIR: &str = "configs/samurai";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Large,
    BasePlus,
    Small,
    Tiny,
}

impl ModelVariant {
    /// Variant named anywhere in a checkpoint path such as
    /// `models/large/sam2.pt` or `sam2.1_hiera_base_plus.pt`. When several
    /// sizes appear the largest wins.
    pub fn from_checkpoint(checkpoint: &Path) -> Result<Self> {
        let path = checkpoint.to_string_lossy();
        let re = Regex::new(r"large|base_plus|small|tiny").map_err(|e| Error::Configuration(e.to_string()))?;
        re.find_iter(&path)
            .filter_map(|m| match m.as_str() {
                "large" => Some(ModelVariant::Large),
                "base_plus" => Some(ModelVariant::BasePlus),
                "small" => Some(ModelVariant::Small),
                "tiny" => Some(ModelVariant::Tiny),
                _ => None,
            })
            .min_by_key(|variant| *variant as u8)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unknown model size in checkpoint '{}'",
                    checkpoint.display()
                ))
            })
    }

    pub fn config_file(&self) -> String {
        let suffix = match self {
            ModelVariant::Large => "l",
            ModelVariant::BasePlus => "b+",
            ModelVariant::Small => "s",
            ModelVariant::Tiny => "t",
        };
        format!("{CONFIG_DIR}/sam2.1_hiera_{suffix}.yaml")
    }
}

#[derive(Debug, Clone)]
pub struct Sam2Config {
    pub checkpoint: PathBuf,
    pub device: String,
    /// Program and leading arguments that start the worker.
    pub command: Vec<String>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request<'a> {
    Init {
        source: &'a Path,
        offload_video_to_cpu: bool,
        offload_state_to_cpu: bool,
    },
    Seed {
        session: u64,
        frame: usize,
        object_id: u32,
        #[serde(rename = "box")]
        corners: [i32; 4],
    },
    Propagate {
        session: u64,
    },
    Release {
        session: u64,
    },
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Reply {
    Ready,
    Initialized {
        session: u64,
        #[serde(default)]
        frames: Option<usize>,
    },
    Seeded,
    Frame {
        frame: usize,
        objects: Vec<RleMask>,
    },
    Done,
    Released,
    Error {
        message: String,
    },
}

/// Row-major run lengths, alternating unoccupied/occupied, starting with an
/// unoccupied run (possibly of length 0).
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RleMask {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub counts: Option<Vec<u32>>,
}

impl RleMask {
    /// `None` when the counts do not add up to the mask size.
    pub fn decode(&self) -> Option<Mask> {
        let counts = self.counts.as_ref()?;
        let total = self.width as usize * self.height as usize;
        let mut data = Vec::with_capacity(total);
        for (idx, run) in counts.iter().enumerate() {
            if data.len() + *run as usize > total {
                return None;
            }
            let value = if idx % 2 == 0 { 0.0 } else { 1.0 };
            data.extend(std::iter::repeat(value).take(*run as usize));
        }
        if data.len() != total {
            return None;
        }
        Mask::from_raw(self.width, self.height, data)
    }

    fn into_object(self) -> ObjectMask {
        let mask = self.decode();
        if mask.is_none() {
            warn!("object {}: unusable mask payload", self.id);
        }
        ObjectMask {
            object_id: self.id,
            mask,
        }
    }
}

/// Encodes `mask` in the worker's run-length format.
pub fn encode_rle(mask: &Mask) -> Vec<u32> {
    let mut counts = vec![];
    let mut current = false;
    let mut run = 0u32;
    for Luma([v]) in mask.pixels() {
        let occupied = *v > 0.0;
        if occupied != current {
            counts.push(run);
            run = 0;
            current = occupied;
        }
        run += 1;
    }
    counts.push(run);
    counts
}

struct WorkerIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerIo {
    async fn send(&mut self, request: &Request<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Reply> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(Error::Model("segmentation worker exited".into()));
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(&line)?);
        }
    }

    async fn call(&mut self, request: &Request<'_>) -> Result<Reply> {
        self.send(request).await?;
        match self.recv().await? {
            Reply::Error { message } => Err(Error::Model(message)),
            reply => Ok(reply),
        }
    }
}

/// Long-lived predictor handle. Dropping it kills the worker.
pub struct Sam2Process {
    _child: Child,
    io: Mutex<WorkerIo>,
    variant: ModelVariant,
}

pub struct Sam2Session {
    id: u64,
    frames: Option<usize>,
}

impl Sam2Process {
    /// Starts the worker and waits until the model is loaded.
    pub async fn spawn(config: &Sam2Config) -> Result<Self> {
        let variant = ModelVariant::from_checkpoint(&config.checkpoint)?;
        let (program, leading) = config
            .command
            .split_first()
            .ok_or_else(|| Error::Configuration("empty segmentation worker command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg("--config")
            .arg(variant.config_file())
            .arg("--checkpoint")
            .arg(&config.checkpoint)
            .arg("--device")
            .arg(&config.device);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Configuration(format!("cannot start segmentation worker '{program}': {e}"))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Model("worker process did not have a handle to stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Model("worker process did not have a handle to stdout".into()))?;

        let mut io = WorkerIo {
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        info!(
            "loading {:?} predictor from {} on {}",
            variant,
            config.checkpoint.display(),
            config.device
        );
        match io.recv().await? {
            Reply::Ready => {}
            Reply::Error { message } => return Err(Error::Configuration(message)),
            other => return Err(Error::Model(format!("unexpected worker greeting {other:?}"))),
        }
        info!("predictor ready");

        Ok(Self {
            _child: child,
            io: Mutex::new(io),
            variant,
        })
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }
}

/// Progress of one propagation pass over the worker pipes.
enum Pass<G> {
    Start,
    Running(G),
    Finished,
}

fn unexpected(reply: Reply) -> Error {
    Error::Model(format!("unexpected worker reply {reply:?}"))
}

impl TrackingModel for Sam2Process {
    type State = Sam2Session;

    async fn init(&self, source: &VideoSource, offload: OffloadPolicy) -> Result<Sam2Session> {
        let mut io = self.io.lock().await;
        let request = Request::Init {
            source: source.path(),
            offload_video_to_cpu: offload.offload_video_to_cpu,
            offload_state_to_cpu: offload.offload_state_to_cpu,
        };
        match io.call(&request).await? {
            Reply::Initialized { session, frames } => {
                debug!("worker session {session} for {}", source.path().display());
                Ok(Sam2Session { id: session, frames })
            }
            other => Err(unexpected(other)),
        }
    }

    async fn seed(&self, state: &mut Sam2Session, frame_index: usize, corners: Corners, object_id: u32) -> Result<()> {
        if let Some(frames) = state.frames {
            if frame_index >= frames {
                return Err(Error::Model(format!(
                    "seed frame {frame_index} is outside the video ({frames} frames)"
                )));
            }
        }
        let mut io = self.io.lock().await;
        let request = Request::Seed {
            session: state.id,
            frame: frame_index,
            object_id,
            corners: corners.as_array(),
        };
        match io.call(&request).await? {
            Reply::Seeded => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn propagate<'a>(&'a self, state: &'a mut Sam2Session) -> PropagationStream<'a> {
        let session = state.id;
        let start = Pass::<MutexGuard<'a, WorkerIo>>::Start;
        stream::unfold(start, move |pass| async move {
            let mut io = match pass {
                Pass::Finished => return None,
                Pass::Running(io) => io,
                Pass::Start => {
                    let mut io = self.io.lock().await;
                    if let Err(e) = io.send(&Request::Propagate { session }).await {
                        return Some((Err(e), Pass::Finished));
                    }
                    io
                }
            };
            match io.recv().await {
                Ok(Reply::Frame { frame, objects }) => {
                    let objects = objects.into_iter().map(RleMask::into_object).collect();
                    let propagation = Propagation {
                        frame_index: frame,
                        objects,
                    };
                    Some((Ok(propagation), Pass::Running(io)))
                }
                Ok(Reply::Done) => None,
                Ok(Reply::Error { message }) => Some((Err(Error::Model(message)), Pass::Finished)),
                Ok(other) => Some((Err(unexpected(other)), Pass::Finished)),
                Err(e) => Some((Err(e), Pass::Finished)),
            }
        })
        .boxed_local()
    }

    async fn release(&self, state: Sam2Session) {
        let mut io = self.io.lock().await;
        if let Err(e) = io.send(&Request::Release { session: state.id }).await {
            warn!("could not release worker session {}: {e}", state.id);
            return;
        }
        // frames of an abandoned propagation may still be in flight
        loop {
            match io.recv().await {
                Ok(Reply::Released) => {
                    debug!("worker session {} released", state.id);
                    return;
                }
                Ok(Reply::Frame { .. }) | Ok(Reply::Done) => continue,
                Ok(Reply::Error { message }) => {
                    warn!("worker failed to release session {}: {message}", state.id);
                    return;
                }
                Ok(other) => {
                    warn!("unexpected worker reply while releasing: {other:?}");
                    return;
                }
                Err(e) => {
                    warn!("could not release worker session {}: {e}", state.id);
                    return;
                }
            }
        }
    }
}
