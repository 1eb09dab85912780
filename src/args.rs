use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TrackerKind {
    /// SAM2 segmentation worker process
    Sam2,
    /// OpenCV CSRT tracker, runs in process
    Csrt,
}

#[derive(Clone, Debug, Parser)]
#[clap(
    name = "boxtrack-rs",
    about = "Bounding Box Tracking Report Generator",
    version,
    author
)]
pub struct Args {
    /// Annotation CSV (video_path,frame,x,y,width,height)
    #[clap(short = 'i', long = "input", default_value = "boxes.csv")]
    pub input: PathBuf,

    /// Tracking result CSV
    #[clap(short = 'o', long = "output", default_value = "tracking_results.csv")]
    pub output: PathBuf,

    /// Directory for the composited videos
    #[clap(short = 'd', long = "outputs-dir", default_value = "outputs")]
    pub outputs_dir: PathBuf,

    /// Skip writing composited videos
    #[clap(long = "no-video")]
    pub no_video: bool,

    /// Tracking backend
    #[clap(short = 't', long = "tracker", value_enum, default_value = "sam2")]
    pub tracker: TrackerKind,

    /// SAM2 checkpoint, the file name selects the model config
    #[clap(long = "model-path", default_value = "sam2/checkpoints/sam2.1_hiera_base_plus.pt")]
    pub model_path: PathBuf,

    /// Device passed to the SAM2 worker
    #[clap(long = "device", default_value = "cuda:0")]
    pub device: String,

    /// Command line that starts the SAM2 worker
    #[clap(long = "model-command", default_value = "python3 scripts/sam2_worker.py")]
    pub model_command: String,

    /// Keep decoded video frames on the device instead of offloading them
    #[clap(long = "keep-video-on-device")]
    pub keep_video_on_device: bool,

    /// Do not back up the annotation file before the run
    #[clap(long = "no-backup")]
    pub no_backup: bool,

    /// Also write centroid speeds to this CSV
    #[clap(long = "speed-report")]
    pub speed_report: Option<PathBuf>,
}

pub fn parse_args() -> Args {
    Args::parse()
}
