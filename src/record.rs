use crate::error::Result;
use crate::geometry::{mask_to_box, BoundingBox};
use image::{GenericImageView, Luma, Primitive};
use log::debug;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Tracked geometry of one object in one frame of one video.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub video_id: String,
    pub frame_index: usize,
    pub object_id: u32,
    pub bbox: BoundingBox,
}

impl FrameRecord {
    pub fn new(video_id: impl Into<String>, frame_index: usize, object_id: u32, bbox: BoundingBox) -> Self {
        Self {
            video_id: video_id.into(),
            frame_index,
            object_id,
            bbox,
        }
    }

    /// Record for a mask; `None` (no mask produced for the frame) maps to the
    /// empty sentinel.
    pub fn from_mask<I, T>(video_id: &str, frame_index: usize, object_id: u32, mask: Option<&I>) -> Self
    where
        I: GenericImageView<Pixel = Luma<T>>,
        T: Primitive + Into<f64>,
    {
        let bbox = match mask {
            Some(mask) => mask_to_box(mask),
            None => {
                debug!("{video_id}: no mask for object {object_id} on frame {frame_index}");
                BoundingBox::EMPTY
            }
        };
        Self::new(video_id, frame_index, object_id, bbox)
    }

    pub fn centroid(&self) -> mint::Point2<f64> {
        self.bbox.centroid()
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct RecordRow {
    video_path: String,
    frame: usize,
    object_id: u32,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    centroid_x: f64,
    centroid_y: f64,
}

impl From<&FrameRecord> for RecordRow {
    fn from(r: &FrameRecord) -> Self {
        let c = r.centroid();
        Self {
            video_path: r.video_id.clone(),
            frame: r.frame_index,
            object_id: r.object_id,
            x: r.bbox.x,
            y: r.bbox.y,
            width: r.bbox.width,
            height: r.bbox.height,
            centroid_x: c.x,
            centroid_y: c.y,
        }
    }
}

pub fn write_records<W: Write>(writer: W, records: &[FrameRecord]) -> Result<()> {
    let mut csv_writer = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    // written by hand so an empty report still carries the header
    csv_writer.write_record([
        "video_path",
        "frame",
        "object_id",
        "x",
        "y",
        "width",
        "height",
        "centroid_x",
        "centroid_y",
    ])?;
    for record in records {
        csv_writer.serialize(RecordRow::from(record))?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Centroid columns are ignored; they are re-derived from the box.
pub fn read_records<R: Read>(reader: R) -> Result<Vec<FrameRecord>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut records = vec![];
    for row in csv_reader.deserialize::<RecordRow>() {
        let row = row?;
        records.push(FrameRecord::new(
            row.video_path,
            row.frame,
            row.object_id,
            BoundingBox::new(row.x, row.y, row.width, row.height),
        ));
    }
    Ok(records)
}

/// Tracking result CSV that is rewritten in full on every call.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    path: PathBuf,
}

impl ReportWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, records: &[FrameRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".partial");
        let tmp = PathBuf::from(tmp_name);

        let file = std::fs::File::create(&tmp)?;
        let mut out = std::io::BufWriter::new(file);
        write_records(&mut out, records)?;
        out.flush()?;
        drop(out);

        std::fs::rename(&tmp, &self.path)?;
        debug!("report {} now holds {} rows", self.path.display(), records.len());
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<FrameRecord>> {
        read_records(std::fs::File::open(&self.path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Mask;
    use image::GrayImage;

    #[test]
    fn rows_carry_derived_centroid() {
        let records = vec![
            FrameRecord::new("test_video.mp4", 10, 0, BoundingBox::new(100, 200, 50, 60)),
            FrameRecord::new("test_video2.mp4", 25, 0, BoundingBox::new(150, 300, 75, 85)),
        ];
        let mut buffer = Vec::new();
        write_records(&mut buffer, &records).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "video_path,frame,object_id,x,y,width,height,centroid_x,centroid_y",
                "test_video.mp4,10,0,100,200,50,60,125.0,230.0",
                "test_video2.mp4,25,0,150,300,75,85,187.5,342.5",
            ]
        );
    }

    #[test]
    fn empty_report_keeps_header() {
        let mut buffer = Vec::new();
        write_records(&mut buffer, &[]).unwrap();
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "video_path,frame,object_id,x,y,width,height,centroid_x,centroid_y\n"
        );
    }

    #[test]
    fn read_back_matches_written() {
        let records = vec![FrameRecord::new("a.mp4", 3, 1, BoundingBox::new(1, 2, 3, 4))];
        let mut buffer = Vec::new();
        write_records(&mut buffer, &records).unwrap();
        assert_eq!(read_records(buffer.as_slice()).unwrap(), records);
    }

    #[test]
    fn missing_mask_is_sentinel() {
        let record = FrameRecord::from_mask::<Mask, f32>("a.mp4", 7, 0, None);
        assert!(record.bbox.is_empty());
        assert_eq!(record.centroid(), mint::Point2 { x: 0.0, y: 0.0 });
    }

    #[test]
    fn mask_record_uses_converter() {
        let mut mask = GrayImage::new(20, 20);
        mask.put_pixel(2, 3, Luma([1]));
        mask.put_pixel(12, 9, Luma([1]));
        let record = FrameRecord::from_mask("a.mp4", 7, 0, Some(&mask));
        assert_eq!(record.bbox, BoundingBox::new(2, 3, 10, 6));
        assert_eq!(record.centroid(), mint::Point2 { x: 7.0, y: 6.0 });
    }

    #[test]
    fn report_writer_overwrites() {
        let dir = tempdir::TempDir::new("boxtrack-report").unwrap();
        let report = ReportWriter::new(dir.path().join("nested").join("tracking_results.csv"));
        let first = vec![FrameRecord::new("a.mp4", 0, 0, BoundingBox::new(1, 1, 1, 1))];
        report.write(&first).unwrap();
        assert_eq!(report.load().unwrap(), first);

        let mut second = first.clone();
        second.push(FrameRecord::new("b.mp4", 4, 0, BoundingBox::EMPTY));
        report.write(&second).unwrap();
        assert_eq!(report.load().unwrap(), second);
        assert!(!dir.path().join("nested").join("tracking_results.csv.partial").exists());
    }
}
