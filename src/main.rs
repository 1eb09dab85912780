use boxtrack::annotation::{self, Annotation, AnnotationStore};
use boxtrack::args::{self, Args, TrackerKind};
use boxtrack::batch::{BatchEvent, BatchOrchestrator, BatchReport};
use boxtrack::compositor;
use boxtrack::ffmpeg_stream;
use boxtrack::logging;
use boxtrack::model::{OffloadPolicy, TrackingModel, VideoSource};
use boxtrack::motion;
use boxtrack::opencv_tracker::CsrtModel;
use boxtrack::record::ReportWriter;
use boxtrack::sam2_process::{Sam2Config, Sam2Process};
use boxtrack::session::SessionOptions;
use boxtrack::Result;
use log::{error, info, warn};
use std::path::Path;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

const EXIT_FATAL: u8 = 1;
const EXIT_PARTIAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = args::parse_args();

    if let Err(e) = logging::setup_logging() {
        eprintln!("logging disabled: {e}");
    }

    match run(&args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_PARTIAL),
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// `Ok(true)` when every step succeeded for every video.
async fn run(args: &Args) -> Result<bool> {
    let store = AnnotationStore::load(&args.input)?;
    if store.is_empty() {
        warn!("no annotations in {}", args.input.display());
    }
    for a in store.iter() {
        VideoSource::resolve(&a.video_id)?;
    }

    if !args.no_backup {
        annotation::backup_annotations(&args.input)?;
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current frame");
            ctrl_c.cancel();
        }
    });

    let options = SessionOptions {
        offload: OffloadPolicy {
            offload_video_to_cpu: !args.keep_video_on_device,
            ..OffloadPolicy::default()
        },
        cancel,
        ..SessionOptions::default()
    };

    match args.tracker {
        TrackerKind::Sam2 => {
            let config = Sam2Config {
                checkpoint: args.model_path.clone(),
                device: args.device.clone(),
                command: args.model_command.split_whitespace().map(str::to_string).collect(),
            };
            let model = Sam2Process::spawn(&config).await?;
            run_pipeline(model, args, store.as_slice(), options).await
        }
        TrackerKind::Csrt => run_pipeline(CsrtModel, args, store.as_slice(), options).await,
    }
}

async fn run_pipeline<M: TrackingModel>(
    model: M,
    args: &Args,
    annotations: &[Annotation],
    options: SessionOptions,
) -> Result<bool> {
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                BatchEvent::VideoStarted { index, total, video_id } => {
                    println!("Processing video {}/{}: {}", index + 1, total, video_id)
                }
                BatchEvent::VideoFinished {
                    video_id,
                    error: Some(e),
                    ..
                } => eprintln!("Error processing {video_id}: {e}"),
                BatchEvent::VideoFinished { .. } | BatchEvent::ReportWritten { .. } => {}
            }
        }
    });

    let report = BatchOrchestrator::new(model)
        .with_options(options)
        .with_report(ReportWriter::new(&args.output))
        .with_events(events_tx)
        .run(annotations)
        .await?;
    let _ = printer.await;

    let mut clean = report.is_clean();
    if !args.no_video {
        clean &= write_videos(args, annotations, &report).await;
    }
    if let Some(path) = &args.speed_report {
        if let Err(e) = write_speed_report(path, &report) {
            error!("speed report {} failed: {e}", path.display());
            eprintln!("Error writing speed report: {e}");
            clean = false;
        }
    }

    if report.is_clean() {
        println!("{}", report.summary());
    } else {
        eprintln!("{}", report.summary());
    }
    println!("Tracking complete. Results saved to {}", args.output.display());
    Ok(clean)
}

async fn write_videos(args: &Args, annotations: &[Annotation], report: &BatchReport) -> bool {
    let mut clean = true;
    for a in annotations {
        if report.skipped.contains(&a.video_id) {
            continue;
        }
        let records: Vec<_> = report.records_for(&a.video_id).cloned().collect();
        if records.is_empty() {
            continue;
        }
        let output = compositor::tracked_output_path(&args.outputs_dir, &a.video_id);
        let result = match VideoSource::resolve(&a.video_id) {
            Ok(source) => compositor::composite_video(&source, &records, &output).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => println!("Output video saved to {}", output.display()),
            Err(e) => {
                error!("compositing {} failed: {e}", a.video_id);
                eprintln!("Error writing {}: {e}", output.display());
                clean = false;
            }
        }
    }
    clean
}

fn write_speed_report(path: &Path, report: &BatchReport) -> Result<()> {
    let samples = motion::centroid_speeds(&report.records, |video| {
        ffmpeg_stream::get_video_fps(Path::new(video))
    });
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    motion::write_speed_report(file, &samples)?;
    info!("speed report written to {}", path.display());
    Ok(())
}
