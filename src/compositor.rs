use crate::error::Result;
use crate::ffmpeg_stream::{self, Frame, FrameWriter};
use crate::model::VideoSource;
use crate::record::FrameRecord;
use futures::Stream;
use futures_util::StreamExt;
use log::info;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

const BOX_THICKNESS: i32 = 2;
const CENTROID_RADIUS: i32 = 4;
const FONT_SCALE: f64 = 0.8;
const LABEL_ORIGIN: (i32, i32) = (10, 30);

fn box_color() -> opencv::core::Scalar {
    opencv::core::Scalar::new(0f64, 255f64, 0f64, 0f64)
}

fn centroid_color() -> opencv::core::Scalar {
    opencv::core::Scalar::new(0f64, 0f64, 255f64, 0f64)
}

fn label_color() -> opencv::core::Scalar {
    opencv::core::Scalar::new(255f64, 255f64, 255f64, 0f64)
}

/// Receives composited frames in order.
#[allow(async_fn_in_trait)]
pub trait FrameSink {
    async fn write_frame(&mut self, frame: &Frame) -> Result<()>;
}

impl FrameSink for FrameWriter {
    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write(frame).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompositeStats {
    pub frames: usize,
    pub annotated: usize,
}

/// `outputs/clip_tracked.mp4` for `vids/clip.mp4`.
pub fn tracked_output_path(outputs_dir: &Path, video_path: &str) -> PathBuf {
    let stem = Path::new(video_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    outputs_dir.join(format!("{stem}_tracked.mp4"))
}

/// Draws box, centroid and frame label of `records` onto `frame`. Sentinel
/// records only get the label.
pub fn draw_overlay(frame: &mut Frame, records: &[&FrameRecord]) -> Result<()> {
    let label = format!("Frame: {}", frame.index);
    frame.with_mat(|mat| {
        for record in records.iter().filter(|r| !r.bbox.is_empty()) {
            let bbox = record.bbox;
            opencv::imgproc::rectangle(
                mat,
                // box extents are inclusive
                opencv::core::Rect::new(bbox.x, bbox.y, bbox.width + 1, bbox.height + 1),
                box_color(),
                BOX_THICKNESS,
                opencv::imgproc::LINE_8,
                0,
            )?;
            let centroid = record.centroid();
            opencv::imgproc::circle(
                mat,
                opencv::core::Point::new(centroid.x.round() as i32, centroid.y.round() as i32),
                CENTROID_RADIUS,
                centroid_color(),
                opencv::imgproc::FILLED,
                opencv::imgproc::LINE_8,
                0,
            )?;
        }

        opencv::imgproc::put_text(
            mat,
            &label,
            opencv::core::Point::new(LABEL_ORIGIN.0, LABEL_ORIGIN.1),
            opencv::imgproc::FONT_HERSHEY_SIMPLEX,
            FONT_SCALE,
            label_color(),
            2,
            opencv::imgproc::LINE_8,
            false,
        )
    })?;
    Ok(())
}

/// Copies `frames` into `sink`, drawing the records of each frame. Frames
/// without records are written untouched.
pub async fn composite_frames<S, K>(mut frames: S, records: &[FrameRecord], sink: &mut K) -> Result<CompositeStats>
where
    S: Stream<Item = io::Result<Frame>> + Unpin,
    K: FrameSink,
{
    let mut by_frame: BTreeMap<usize, Vec<&FrameRecord>> = BTreeMap::new();
    for record in records {
        by_frame.entry(record.frame_index).or_default().push(record);
    }

    let mut stats = CompositeStats::default();
    while let Some(frame) = frames.next().await {
        let mut frame = frame?;
        if let Some(frame_records) = by_frame.get(&frame.index) {
            draw_overlay(&mut frame, frame_records)?;
            stats.annotated += 1;
        }
        sink.write_frame(&frame).await?;
        stats.frames += 1;
    }
    Ok(stats)
}

/// Writes `output` as a copy of `source` with `records` burned in.
pub async fn composite_video(source: &VideoSource, records: &[FrameRecord], output: &Path) -> Result<CompositeStats> {
    let (info, frames) = ffmpeg_stream::open_source(source)?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = FrameWriter::spawn(output, &info)?;
    match composite_frames(frames, records, &mut writer).await {
        Ok(stats) => {
            writer.finish().await?;
            info!(
                "wrote {} ({} frames, {} annotated)",
                output.display(),
                stats.frames,
                stats.annotated
            );
            Ok(stats)
        }
        Err(e) => {
            writer.abort().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg_stream::FrameBuffer;
    use crate::geometry::BoundingBox;
    use futures::stream;
    use image::Rgb;

    impl FrameSink for Vec<Frame> {
        async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
            self.push(frame.clone());
            Ok(())
        }
    }

    fn gray_frames(count: usize) -> Vec<Frame> {
        (0..count)
            .map(|i| Frame::new(i, FrameBuffer::from_pixel(160, 120, Rgb([40, 40, 40]))))
            .collect()
    }

    fn as_stream(frames: Vec<Frame>) -> impl Stream<Item = io::Result<Frame>> + Unpin {
        stream::iter(frames.into_iter().map(Ok))
    }

    #[test]
    fn output_names_use_source_stem() {
        assert_eq!(
            tracked_output_path(Path::new("outputs"), "/path/to/video.mp4"),
            Path::new("outputs/video_tracked.mp4")
        );
        assert_eq!(
            tracked_output_path(Path::new("outputs"), "/path/to/another_video.avi"),
            Path::new("outputs/another_video_tracked.mp4")
        );
    }

    #[tokio::test]
    async fn no_records_passes_every_frame_through() {
        let source = gray_frames(4);
        let mut sink: Vec<Frame> = vec![];
        let stats = composite_frames(as_stream(source.clone()), &[], &mut sink).await.unwrap();
        assert_eq!(stats, CompositeStats { frames: 4, annotated: 0 });
        assert_eq!(sink.len(), 4);
        for (written, original) in sink.iter().zip(&source) {
            assert_eq!(written.index, original.index);
            assert_eq!(written.image, original.image);
        }
    }

    #[tokio::test]
    async fn only_matching_frames_are_drawn() {
        let source = gray_frames(3);
        let records = vec![FrameRecord::new("clip.mp4", 1, 0, BoundingBox::new(20, 30, 40, 50))];
        let mut sink: Vec<Frame> = vec![];
        let stats = composite_frames(as_stream(source.clone()), &records, &mut sink).await.unwrap();
        assert_eq!(stats, CompositeStats { frames: 3, annotated: 1 });

        assert_eq!(sink[0].image, source[0].image);
        assert_eq!(sink[2].image, source[2].image);
        assert_ne!(sink[1].image, source[1].image);
        // box edge is green in bgr order
        assert_eq!(sink[1].image.get_pixel(20, 60).0, [0, 255, 0]);
        // right and bottom edges sit on x + width and y + height
        assert_eq!(sink[1].image.get_pixel(60, 55).0, [0, 255, 0]);
        assert_eq!(sink[1].image.get_pixel(40, 80).0, [0, 255, 0]);
        // centroid at (40, 55) is red
        assert_eq!(sink[1].image.get_pixel(40, 55).0, [0, 0, 255]);
    }

    #[test]
    fn sentinel_record_only_gets_label() {
        let mut frame = gray_frames(1).remove(0);
        let record = FrameRecord::new("clip.mp4", 0, 0, BoundingBox::EMPTY);
        draw_overlay(&mut frame, &[&record]).unwrap();
        // origin untouched, label pixels white
        assert_eq!(frame.image.get_pixel(0, 0).0, [40, 40, 40]);
        assert!(frame.image.pixels().any(|p| p.0 == [255, 255, 255]));
        assert!(!frame.image.pixels().any(|p| p.0 == [0, 255, 0]));
    }

    #[tokio::test]
    async fn decode_errors_stop_compositing() {
        let frames = stream::iter(vec![
            Ok(gray_frames(1).remove(0)),
            Err(io::Error::new(io::ErrorKind::InvalidData, "broken")),
        ]);
        let mut sink: Vec<Frame> = vec![];
        assert!(composite_frames(frames, &[], &mut sink).await.is_err());
        assert_eq!(sink.len(), 1);
    }
}
