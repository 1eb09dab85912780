use crate::error::Result;
use crate::record::FrameRecord;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;

/// Centroid speed of one object on one frame, in pixels per second.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSample {
    pub video_id: String,
    pub frame_index: usize,
    pub object_id: u32,
    pub centroid: mint::Point2<f64>,
    pub speed: f64,
}

#[derive(Serialize)]
struct MotionRow<'a> {
    video_path: &'a str,
    frame: usize,
    object_id: u32,
    centroid_x: f64,
    centroid_y: f64,
    speed: f64,
}

/// One sample per record, in record order.
///
/// Speed is the centroid displacement since the previous tracked frame of the
/// same object divided by the elapsed time. Sentinel records get speed 0 and
/// are not used as a previous position.
pub fn centroid_speeds<F>(records: &[FrameRecord], fps: F) -> Vec<MotionSample>
where
    F: Fn(&str) -> f32,
{
    let mut last_seen: HashMap<(&str, u32), (usize, mint::Point2<f64>)> = HashMap::new();
    let mut video_fps: HashMap<&str, f64> = HashMap::new();

    records
        .iter()
        .map(|record| {
            let centroid = record.centroid();
            let key = (record.video_id.as_str(), record.object_id);
            let rate = *video_fps
                .entry(record.video_id.as_str())
                .or_insert_with(|| fps(&record.video_id) as f64);

            let speed = if record.bbox.is_empty() {
                0.0
            } else {
                let speed = match last_seen.get(&key) {
                    Some((frame, previous)) if record.frame_index > *frame => {
                        let dx = centroid.x - previous.x;
                        let dy = centroid.y - previous.y;
                        let elapsed = (record.frame_index - frame) as f64 / rate;
                        (dx * dx + dy * dy).sqrt() / elapsed
                    }
                    _ => 0.0,
                };
                last_seen.insert(key, (record.frame_index, centroid));
                speed
            };

            MotionSample {
                video_id: record.video_id.clone(),
                frame_index: record.frame_index,
                object_id: record.object_id,
                centroid,
                speed,
            }
        })
        .collect()
}

pub fn write_speed_report<W: Write>(writer: W, samples: &[MotionSample]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for s in samples {
        csv_writer.serialize(MotionRow {
            video_path: &s.video_id,
            frame: s.frame_index,
            object_id: s.object_id,
            centroid_x: s.centroid.x,
            centroid_y: s.centroid.y,
            speed: s.speed,
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}
