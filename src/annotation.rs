use crate::error::{Error, Result};
use crate::geometry::BoundingBox;
use log::info;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Human chosen seed for one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub video_id: String,
    pub frame_index: usize,
    pub bbox: BoundingBox,
}

impl Annotation {
    pub fn new(video_id: impl Into<String>, frame_index: usize, bbox: BoundingBox) -> Self {
        Self {
            video_id: video_id.into(),
            frame_index,
            bbox,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct AnnotationRow {
    video_path: String,
    frame: f64,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// Drops the fractional part of a CSV number that must fit an `i32`.
fn truncated(value: f64, field: &str, line: usize) -> Result<i32> {
    let whole = value.trunc();
    if !whole.is_finite() || whole < i32::MIN as f64 || whole > i32::MAX as f64 {
        return Err(Error::Configuration(format!(
            "annotation line {line}: {field} {value} is out of range"
        )));
    }
    Ok(whole as i32)
}

/// Annotations in encounter order, at most one per video.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AnnotationStore {
    entries: Vec<Annotation>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `annotation`, replacing an earlier one for the same video in
    /// place. Returns the replaced annotation.
    pub fn insert(&mut self, annotation: Annotation) -> Option<Annotation> {
        match self
            .entries
            .iter_mut()
            .find(|a| a.video_id == annotation.video_id)
        {
            Some(existing) => Some(std::mem::replace(existing, annotation)),
            None => {
                self.entries.push(annotation);
                None
            }
        }
    }

    pub fn get(&self, video_id: &str) -> Option<&Annotation> {
        self.entries.iter().find(|a| a.video_id == video_id)
    }

    pub fn remove(&mut self, video_id: &str) -> Option<Annotation> {
        let idx = self.entries.iter().position(|a| a.video_id == video_id)?;
        Some(self.entries.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Annotation] {
        &self.entries
    }

    pub fn into_vec(self) -> Vec<Annotation> {
        self.entries
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        let mut store = Self::new();
        let mut csv_reader = csv::Reader::from_reader(reader);
        for (idx, row) in csv_reader.deserialize::<AnnotationRow>().enumerate() {
            let row = row?;
            // header is line 1
            let line = idx + 2;
            if row.video_path.is_empty() {
                return Err(Error::Configuration(format!(
                    "annotation line {line}: empty video_path"
                )));
            }
            if row.frame < 0.0 || row.width < 0.0 || row.height < 0.0 {
                return Err(Error::Configuration(format!(
                    "annotation line {line}: frame, width and height must not be negative"
                )));
            }
            let frame = truncated(row.frame, "frame", line)?;
            let x = truncated(row.x, "x", line)?;
            let y = truncated(row.y, "y", line)?;
            let width = truncated(row.width, "width", line)?;
            let height = truncated(row.height, "height", line)?;
            if x.checked_add(width).is_none() || y.checked_add(height).is_none() {
                return Err(Error::Configuration(format!(
                    "annotation line {line}: box extends past the coordinate range"
                )));
            }
            let bbox = BoundingBox::new(x, y, width, height);
            store.insert(Annotation::new(row.video_path, frame as usize, bbox));
        }
        Ok(store)
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        // integers are written without a fractional part
        csv_writer.write_record(["video_path", "frame", "x", "y", "width", "height"])?;
        for a in &self.entries {
            csv_writer.write_record([
                a.video_id.clone(),
                a.frame_index.to_string(),
                a.bbox.x.to_string(),
                a.bbox.y.to_string(),
                a.bbox.width.to_string(),
                a.bbox.height.to_string(),
            ])?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            Error::Configuration(format!("cannot open annotations {}: {e}", path.display()))
        })?;
        let store = Self::read_from(file)?;
        info!("loaded {} annotations from {}", store.len(), path.display());
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.write_to(file)?;
        info!("saved {} annotations to {}", self.len(), path.display());
        Ok(())
    }
}

impl FromIterator<Annotation> for AnnotationStore {
    fn from_iter<T: IntoIterator<Item = Annotation>>(iter: T) -> Self {
        let mut store = Self::new();
        for a in iter {
            store.insert(a);
        }
        store
    }
}

/// `boxes.csv` at 2024-05-01 13:45:09 becomes `boxes_backup_20240501_134509.csv`.
pub fn backup_path(path: &Path, timestamp: chrono::NaiveDateTime) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "annotations".to_string());
    let name = format!("{stem}_backup_{}.csv", timestamp.format("%Y%m%d_%H%M%S"));
    path.with_file_name(name)
}

/// Copies the annotation file next to itself with a timestamped name.
pub fn backup_annotations(path: &Path) -> Result<PathBuf> {
    let target = backup_path(path, chrono::Local::now().naive_local());
    std::fs::copy(path, &target)?;
    info!("annotation backup written to {}", target.display());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const SAMPLE: &str = "video_path,frame,x,y,width,height\n\
                          test_video.mp4,10,100,200,50,60\n\
                          test_video2.mp4,25,150,300,75.9,85.2\n";

    #[test]
    fn reads_rows_in_order_and_truncates_floats() {
        let store = AnnotationStore::read_from(SAMPLE.as_bytes()).unwrap();
        assert_eq!(store.len(), 2);
        let first = &store.as_slice()[0];
        assert_eq!(first.video_id, "test_video.mp4");
        assert_eq!(first.frame_index, 10);
        assert_eq!(first.bbox, BoundingBox::new(100, 200, 50, 60));
        let second = store.get("test_video2.mp4").unwrap();
        assert_eq!(second.bbox, BoundingBox::new(150, 300, 75, 85));
    }

    #[test]
    fn last_write_wins_and_keeps_position() {
        let mut store = AnnotationStore::new();
        store.insert(Annotation::new("a.mp4", 1, BoundingBox::new(1, 1, 1, 1)));
        store.insert(Annotation::new("b.mp4", 2, BoundingBox::new(2, 2, 2, 2)));
        let old = store.insert(Annotation::new("a.mp4", 9, BoundingBox::new(9, 9, 9, 9)));
        assert_eq!(old.unwrap().frame_index, 1);
        let ids: Vec<_> = store.iter().map(|a| a.video_id.as_str()).collect();
        assert_eq!(ids, ["a.mp4", "b.mp4"]);
        assert_eq!(store.get("a.mp4").unwrap().frame_index, 9);
    }

    #[test]
    fn duplicate_rows_in_file_collapse() {
        let csv = "video_path,frame,x,y,width,height\n\
                   a.mp4,1,0,0,10,10\n\
                   a.mp4,4,5,5,20,20\n";
        let store = AnnotationStore::read_from(csv.as_bytes()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a.mp4").unwrap().frame_index, 4);
    }

    #[test]
    fn round_trip_is_order_insensitive_identity() {
        let store = AnnotationStore::read_from(SAMPLE.as_bytes()).unwrap();
        let mut buffer = Vec::new();
        store.write_to(&mut buffer).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("video_path,frame,x,y,width,height\n"));
        assert!(text.contains("test_video2.mp4,25,150,300,75,85"));

        let reread = AnnotationStore::read_from(buffer.as_slice()).unwrap();
        let mut left = store.into_vec();
        let mut right = reread.into_vec();
        left.sort_by(|a, b| a.video_id.cmp(&b.video_id));
        right.sort_by(|a, b| a.video_id.cmp(&b.video_id));
        assert_eq!(left, right);
    }

    #[test]
    fn negative_extent_is_a_configuration_error() {
        let csv = "video_path,frame,x,y,width,height\nclip.mp4,0,1,1,-5,3\n";
        let err = AnnotationStore::read_from(csv.as_bytes()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn non_finite_and_oversized_values_are_configuration_errors() {
        for row in [
            "clip.mp4,NaN,1,1,5,5",
            "clip.mp4,0,inf,1,5,5",
            "clip.mp4,0,1,1,1e12,5",
            "clip.mp4,1e20,1,1,5,5",
            "clip.mp4,0,2147483000,1,5000,5",
        ] {
            let csv = format!("video_path,frame,x,y,width,height\n{row}\n");
            let err = AnnotationStore::read_from(csv.as_bytes()).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{row}: {err:?}");
        }
    }

    #[test]
    fn missing_column_is_rejected() {
        let csv = "video_path,frame,x,y,width\nclip.mp4,0,1,1,5\n";
        assert!(AnnotationStore::read_from(csv.as_bytes()).is_err());
    }

    #[test]
    fn backup_name_carries_timestamp() {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(13, 45, 9)
            .unwrap();
        let path = backup_path(Path::new("/data/boxes.csv"), ts);
        assert_eq!(path, Path::new("/data/boxes_backup_20240501_134509.csv"));
    }

    #[test]
    fn save_load_and_backup_on_disk() {
        let dir = tempdir::TempDir::new("boxtrack-annotations").unwrap();
        let path = dir.path().join("boxes.csv");
        let store: AnnotationStore = vec![Annotation::new(
            "clip.mp4",
            5,
            BoundingBox::new(100, 200, 50, 60),
        )]
        .into_iter()
        .collect();
        store.save(&path).unwrap();
        assert_eq!(AnnotationStore::load(&path).unwrap(), store);

        let backup = backup_annotations(&path).unwrap();
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("boxes_backup_"));
        assert_eq!(AnnotationStore::load(&backup).unwrap(), store);
    }
}
