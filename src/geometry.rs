use image::{GenericImageView, ImageBuffer, Luma, Primitive};
use serde::{Deserialize, Serialize};

/// Per-pixel occupancy of one object in one frame. A cell is occupied when
/// its value is greater than zero.
pub type Mask = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Left-top-width-height box in pixel coordinates.
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Left-top-right-bottom box, the form the tracking model is seeded with.
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Corners {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Geometry reported for a mask without any occupied cell.
    pub const EMPTY: BoundingBox = BoundingBox {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Centroid derived from the box. The sentinel box yields (0, 0).
    pub fn centroid(&self) -> mint::Point2<f64> {
        mint::Point2 {
            x: self.x as f64 + self.width as f64 / 2.0,
            y: self.y as f64 + self.height as f64 / 2.0,
        }
    }

    #[inline]
    pub fn to_corners(&self) -> Corners {
        Corners {
            x1: self.x,
            y1: self.y,
            x2: self.x + self.width,
            y2: self.y + self.height,
        }
    }
}

impl Corners {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Converts back to left-top-width-height, accepting corners given in
    /// either order (a rubber band dragged up or left).
    pub fn to_box(&self) -> BoundingBox {
        let (left, right) = (self.x1.min(self.x2), self.x1.max(self.x2));
        let (top, bottom) = (self.y1.min(self.y2), self.y1.max(self.y2));
        BoundingBox::new(left, top, right - left, bottom - top)
    }

    pub fn as_array(&self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

impl From<BoundingBox> for Corners {
    fn from(bbox: BoundingBox) -> Self {
        bbox.to_corners()
    }
}

impl From<Corners> for BoundingBox {
    fn from(corners: Corners) -> Self {
        corners.to_box()
    }
}

/// Minimal box covering every occupied cell of `mask`.
///
/// Width and height are the differences of the inclusive pixel extents, so a
/// single occupied pixel gives a zero sized box at that pixel. A mask with no
/// occupied cell gives [`BoundingBox::EMPTY`].
pub fn mask_to_box<I, T>(mask: &I) -> BoundingBox
where
    I: GenericImageView<Pixel = Luma<T>>,
    T: Primitive + Into<f64>,
{
    let mut extent: Option<(u32, u32, u32, u32)> = None;

    for (x, y, pixel) in mask.pixels() {
        if pixel.0[0].into() <= 0.0 {
            continue;
        }
        extent = Some(match extent {
            None => (x, y, x, y),
            Some((x_min, y_min, x_max, y_max)) => {
                (x_min.min(x), y_min.min(y), x_max.max(x), y_max.max(y))
            }
        });
    }

    match extent {
        Some((x_min, y_min, x_max, y_max)) => BoundingBox::new(
            x_min as i32,
            y_min as i32,
            (x_max - x_min) as i32,
            (y_max - y_min) as i32,
        ),
        None => BoundingBox::EMPTY,
    }
}

/// Filled mask of `width` x `height` with the cells inside `bbox` (inclusive
/// extents) occupied.
pub fn box_to_mask(bbox: &BoundingBox, width: u32, height: u32) -> Mask {
    let x_range = bbox.x..=bbox.x + bbox.width;
    let y_range = bbox.y..=bbox.y + bbox.height;
    Mask::from_fn(width, height, |x, y| {
        if x_range.contains(&(x as i32)) && y_range.contains(&(y as i32)) {
            Luma([1.0])
        } else {
            Luma([0.0])
        }
    })
}
