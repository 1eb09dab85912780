use crate::annotation::Annotation;
use crate::error::{Error, Result};
use crate::model::{OffloadPolicy, TrackingModel, VideoSource};
use crate::record::FrameRecord;
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

/// Object id the human drawn box is registered under.
pub const SEED_OBJECT_ID: u32 = 0;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub offload: OffloadPolicy,
    pub object_id: u32,
    pub cancel: CancellationToken,
}

/// Records produced for one video. `error` is set when the session ended
/// early; `records` then holds what was produced before the failure.
#[derive(Debug)]
pub struct SessionOutcome {
    pub records: Vec<FrameRecord>,
    pub error: Option<Error>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Tracks the annotated object through one video.
///
/// The model state is released before returning whenever `init` succeeded,
/// regardless of how seeding or propagation ended.
pub async fn track_video<M: TrackingModel>(
    model: &M,
    source: &VideoSource,
    annotation: &Annotation,
    options: &SessionOptions,
) -> SessionOutcome {
    let mut records = vec![];

    let mut state = match model.init(source, options.offload).await {
        Ok(state) => state,
        Err(e) => {
            error!("{}: tracker init failed: {e}", annotation.video_id);
            return SessionOutcome {
                records,
                error: Some(e),
            };
        }
    };

    let result = drive(model, &mut state, annotation, options, &mut records).await;
    model.release(state).await;

    match &result {
        Ok(()) => info!(
            "{}: {} records from frame {}",
            annotation.video_id,
            records.len(),
            annotation.frame_index
        ),
        Err(e) => error!(
            "{}: tracking stopped after {} records: {e}",
            annotation.video_id,
            records.len()
        ),
    }

    SessionOutcome {
        records,
        error: result.err(),
    }
}

async fn drive<M: TrackingModel>(
    model: &M,
    state: &mut M::State,
    annotation: &Annotation,
    options: &SessionOptions,
    records: &mut Vec<FrameRecord>,
) -> Result<()> {
    let seed_frame = annotation.frame_index;
    model
        .seed(state, seed_frame, annotation.bbox.to_corners(), options.object_id)
        .await?;

    let mut propagation = model.propagate(state);
    let mut last_frame: Option<usize> = None;

    while let Some(item) = propagation.next().await {
        let frame = item?;

        if let Some(last) = last_frame {
            if frame.frame_index <= last {
                return Err(Error::Model(format!(
                    "frame {} reported after frame {last}",
                    frame.frame_index
                )));
            }
        }
        last_frame = Some(frame.frame_index);

        if frame.frame_index < seed_frame {
            debug!(
                "{}: skip frame {} before seed frame {seed_frame}",
                annotation.video_id, frame.frame_index
            );
        } else {
            for object in &frame.objects {
                records.push(FrameRecord::from_mask(
                    &annotation.video_id,
                    frame.frame_index,
                    object.object_id,
                    object.mask.as_ref(),
                ));
            }
        }

        if options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
    }

    Ok(())
}
