use crate::annotation::Annotation;
use crate::error::{Error, Result};
use crate::model::{TrackingModel, VideoSource};
use crate::record::{FrameRecord, ReportWriter};
use crate::session::{track_video, SessionOptions};
use log::{error, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Progress notifications of a running batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    VideoStarted {
        index: usize,
        total: usize,
        video_id: String,
    },
    VideoFinished {
        video_id: String,
        records: usize,
        error: Option<String>,
    },
    ReportWritten {
        rows: usize,
    },
}

#[derive(Debug)]
pub struct VideoFailure {
    pub video_id: String,
    /// Records kept from before the failure.
    pub records: usize,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub records: Vec<FrameRecord>,
    pub succeeded: Vec<String>,
    pub failed: Vec<VideoFailure>,
    /// Report writes that failed; tracking went on regardless.
    pub report_errors: Vec<Error>,
    /// Videos never started because the batch was cancelled.
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.report_errors.is_empty() && self.skipped.is_empty()
    }

    pub fn records_for<'a>(&'a self, video_id: &'a str) -> impl Iterator<Item = &'a FrameRecord> + 'a {
        self.records.iter().filter(move |r| r.video_id == video_id)
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "{} videos tracked, {} failed, {} records",
            self.succeeded.len(),
            self.failed.len(),
            self.records.len()
        );
        for failure in &self.failed {
            text.push_str(&format!(
                "\n  FAILED {} ({} records kept): {}",
                failure.video_id, failure.records, failure.error
            ));
        }
        for video_id in &self.skipped {
            text.push_str(&format!("\n  SKIPPED {video_id}"));
        }
        for e in &self.report_errors {
            text.push_str(&format!("\n  REPORT {e}"));
        }
        text
    }
}

/// Runs one tracking session per annotation, in order, with a single model
/// handle owned by the batch.
pub struct BatchOrchestrator<M: TrackingModel> {
    model: M,
    options: SessionOptions,
    report: Option<ReportWriter>,
    events: Option<UnboundedSender<BatchEvent>>,
}

impl<M: TrackingModel> BatchOrchestrator<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            options: SessionOptions::default(),
            report: None,
            events: None,
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Rewrites `report` after every video.
    pub fn with_report(mut self, report: ReportWriter) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<BatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.options.cancel.clone()
    }

    fn notify(&self, event: BatchEvent) {
        if let Some(events) = &self.events {
            // a dropped receiver only means nobody listens anymore
            let _ = events.send(event);
        }
    }

    fn write_report(&self, report: &mut BatchReport) {
        let Some(writer) = &self.report else {
            return;
        };
        match writer.write(&report.records) {
            Ok(()) => self.notify(BatchEvent::ReportWritten {
                rows: report.records.len(),
            }),
            Err(e) => {
                error!("could not write report {}: {e}", writer.path().display());
                report.report_errors.push(e);
            }
        }
    }

    /// Runs the batch and drops the model handle afterwards.
    ///
    /// Fails only on configuration errors, before any video is touched.
    pub async fn run(self, annotations: &[Annotation]) -> Result<BatchReport> {
        let sources = annotations
            .iter()
            .map(|a| VideoSource::resolve(&a.video_id))
            .collect::<Result<Vec<_>>>()?;

        let total = annotations.len();
        let mut report = BatchReport::default();
        info!("start tracking batch of {total} videos");

        for (index, (annotation, source)) in annotations.iter().zip(&sources).enumerate() {
            if self.options.cancel.is_cancelled() {
                warn!("batch cancelled before {}", annotation.video_id);
                report.skipped.push(annotation.video_id.clone());
                continue;
            }

            self.notify(BatchEvent::VideoStarted {
                index,
                total,
                video_id: annotation.video_id.clone(),
            });
            info!("[{}/{total}] tracking {}", index + 1, annotation.video_id);

            let outcome = track_video(&self.model, source, annotation, &self.options).await;
            let produced = outcome.records.len();
            report.records.extend(outcome.records);

            self.notify(BatchEvent::VideoFinished {
                video_id: annotation.video_id.clone(),
                records: produced,
                error: outcome.error.as_ref().map(|e| e.to_string()),
            });

            match outcome.error {
                None => report.succeeded.push(annotation.video_id.clone()),
                Some(e) => report.failed.push(VideoFailure {
                    video_id: annotation.video_id.clone(),
                    records: produced,
                    error: e,
                }),
            }

            self.write_report(&mut report);
        }

        // a run without any tracked video still replaces the previous report
        if report.succeeded.is_empty() && report.failed.is_empty() {
            self.write_report(&mut report);
        }

        info!(
            "tracking batch done: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
