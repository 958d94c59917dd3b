//! Image primitives: bounding boxes and the three-plane masked image.
//!
//! A [`MaskedImage`] couples an intensity plane, a variance plane and a bit
//! mask, all of the same shape, with an integer origin so sub-images keep
//! their parent coordinates.  Arrays are indexed `[[row, col]]`; image
//! coordinates `(x, y)` map to `(col, row)` offset by the origin.

use std::collections::BTreeMap;

use ndarray::{s, Array2};

use crate::error::Error;

/// Number of bits available in the mask plane.
const MASK_BITS: u8 = 16;

/// Integer bounding box in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    /// Minimum x (column) coordinate.
    pub x0: i32,
    /// Minimum y (row) coordinate.
    pub y0: i32,
    /// Extent in x.
    pub width: usize,
    /// Extent in y.
    pub height: usize,
}

impl BBox {
    /// Create a bounding box from its minimum corner and extent.
    pub fn new(x0: i32, y0: i32, width: usize, height: usize) -> Self {
        Self {
            x0,
            y0,
            width,
            height,
        }
    }

    /// Maximum x coordinate (inclusive).
    pub fn x1(&self) -> i32 {
        self.x0 + self.width as i32 - 1
    }

    /// Maximum y coordinate (inclusive).
    pub fn y1(&self) -> i32 {
        self.y0 + self.height as i32 - 1
    }

    /// Center of the box, `(0.5 (x0 + x1), 0.5 (y0 + y1))`.
    pub fn center(&self) -> (f64, f64) {
        (
            0.5 * (self.x0 + self.x1()) as f64,
            0.5 * (self.y0 + self.y1()) as f64,
        )
    }

    /// The box grown by `n` pixels on every side.
    pub fn grown(&self, n: usize) -> BBox {
        BBox {
            x0: self.x0 - n as i32,
            y0: self.y0 - n as i32,
            width: self.width + 2 * n,
            height: self.height + 2 * n,
        }
    }

    /// Whether `other` lies entirely inside this box.
    pub fn contains(&self, other: &BBox) -> bool {
        other.x0 >= self.x0
            && other.y0 >= self.y0
            && other.x1() <= self.x1()
            && other.y1() <= self.y1()
    }

    /// Whether the point `(x, y)` lies inside this box.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.x0 as f64 && x <= self.x1() as f64 && y >= self.y0 as f64 && y <= self.y1() as f64
    }
}

/// Three coupled image planes (intensity, variance, mask) with an integer
/// origin and named mask planes.
#[derive(Debug, Clone)]
pub struct MaskedImage {
    image: Array2<f64>,
    variance: Array2<f64>,
    mask: Array2<u16>,
    x0: i32,
    y0: i32,
    planes: BTreeMap<String, u8>,
}

impl MaskedImage {
    /// Create an image of the given size with all planes zeroed and origin
    /// `(0, 0)`.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            image: Array2::zeros((height, width)),
            variance: Array2::zeros((height, width)),
            mask: Array2::zeros((height, width)),
            x0: 0,
            y0: 0,
            planes: BTreeMap::new(),
        }
    }

    /// Assemble a masked image from existing planes.
    ///
    /// Fails with [`Error::Domain`] unless all three planes have the same
    /// shape.
    pub fn from_parts(
        image: Array2<f64>,
        variance: Array2<f64>,
        mask: Array2<u16>,
    ) -> Result<Self, Error> {
        if image.dim() != variance.dim() || image.dim() != mask.dim() {
            return Err(Error::Domain(format!(
                "masked image planes disagree in shape: {:?} vs {:?} vs {:?}",
                image.dim(),
                variance.dim(),
                mask.dim()
            )));
        }
        Ok(Self {
            image,
            variance,
            mask,
            x0: 0,
            y0: 0,
            planes: BTreeMap::new(),
        })
    }

    /// Width (columns) of the planes.
    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    /// Height (rows) of the planes.
    pub fn height(&self) -> usize {
        self.image.nrows()
    }

    /// x coordinate of the first column.
    pub fn x0(&self) -> i32 {
        self.x0
    }

    /// y coordinate of the first row.
    pub fn y0(&self) -> i32 {
        self.y0
    }

    /// Set the image origin.
    pub fn set_xy0(&mut self, x0: i32, y0: i32) {
        self.x0 = x0;
        self.y0 = y0;
    }

    /// The image extent as a bounding box in image coordinates.
    pub fn extent(&self) -> BBox {
        BBox::new(self.x0, self.y0, self.width(), self.height())
    }

    /// Image coordinates of the pixel at `[[row, col]]`.
    pub fn position(&self, col: usize, row: usize) -> (f64, f64) {
        (self.x0 as f64 + col as f64, self.y0 as f64 + row as f64)
    }

    /// Intensity plane.
    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    /// Mutable intensity plane.
    pub fn image_mut(&mut self) -> &mut Array2<f64> {
        &mut self.image
    }

    /// Variance plane.
    pub fn variance(&self) -> &Array2<f64> {
        &self.variance
    }

    /// Mutable variance plane.
    pub fn variance_mut(&mut self) -> &mut Array2<f64> {
        &mut self.variance
    }

    /// Mask plane.
    pub fn mask(&self) -> &Array2<u16> {
        &self.mask
    }

    /// Mutable mask plane.
    pub fn mask_mut(&mut self) -> &mut Array2<u16> {
        &mut self.mask
    }

    /// Register a named mask plane, returning its bit mask.  Re-registering
    /// an existing name returns the same bit.  Fails once all bits are in
    /// use.
    pub fn add_mask_plane(&mut self, name: &str) -> Result<u16, Error> {
        if let Some(&bit) = self.planes.get(name) {
            return Ok(1 << bit);
        }
        let used: Vec<u8> = self.planes.values().copied().collect();
        for bit in 0..MASK_BITS {
            if !used.contains(&bit) {
                self.planes.insert(name.to_string(), bit);
                return Ok(1 << bit);
            }
        }
        Err(Error::Domain(format!(
            "no free mask plane for '{name}': all {MASK_BITS} bits in use"
        )))
    }

    /// Bit mask of a registered plane, if any.
    pub fn mask_plane(&self, name: &str) -> Option<u16> {
        self.planes.get(name).map(|&bit| 1 << bit)
    }

    /// Clear the given bits everywhere in the mask plane.
    pub fn clear_mask_plane(&mut self, bits: u16) {
        self.mask.mapv_inplace(|m| m & !bits);
    }

    fn local_range(&self, bbox: &BBox) -> Result<(usize, usize, usize, usize), Error> {
        if !self.extent().contains(bbox) {
            return Err(Error::Domain(format!(
                "bbox ({}, {}) {}x{} not contained in image ({}, {}) {}x{}",
                bbox.x0,
                bbox.y0,
                bbox.width,
                bbox.height,
                self.x0,
                self.y0,
                self.width(),
                self.height()
            )));
        }
        let r0 = (bbox.y0 - self.y0) as usize;
        let c0 = (bbox.x0 - self.x0) as usize;
        Ok((r0, c0, bbox.height, bbox.width))
    }

    /// OR the given bits into the mask over `bbox`.
    pub fn set_mask_region(&mut self, bbox: &BBox, bits: u16) -> Result<(), Error> {
        let (r0, c0, h, w) = self.local_range(bbox)?;
        self.mask
            .slice_mut(s![r0..r0 + h, c0..c0 + w])
            .mapv_inplace(|m| m | bits);
        Ok(())
    }

    /// OR of every mask value within `bbox`: nonzero iff any bit is set in
    /// the region.
    pub fn or_of_mask_region(&self, bbox: &BBox) -> Result<u16, Error> {
        let (r0, c0, h, w) = self.local_range(bbox)?;
        Ok(self
            .mask
            .slice(s![r0..r0 + h, c0..c0 + w])
            .iter()
            .fold(0, |acc, &m| acc | m))
    }

    /// Copy out the sub-image covering `bbox`, keeping image coordinates and
    /// registered plane names.
    pub fn sub_image(&self, bbox: &BBox) -> Result<MaskedImage, Error> {
        let (r0, c0, h, w) = self.local_range(bbox)?;
        Ok(MaskedImage {
            image: self.image.slice(s![r0..r0 + h, c0..c0 + w]).to_owned(),
            variance: self.variance.slice(s![r0..r0 + h, c0..c0 + w]).to_owned(),
            mask: self.mask.slice(s![r0..r0 + h, c0..c0 + w]).to_owned(),
            x0: bbox.x0,
            y0: bbox.y0,
            planes: self.planes.clone(),
        })
    }

    /// In-place subtraction of another masked image: intensities subtract,
    /// variances add, masks OR.
    pub fn subtract(&mut self, other: &MaskedImage) -> Result<(), Error> {
        if self.image.dim() != other.image.dim() {
            return Err(Error::Domain(format!(
                "cannot subtract images of shapes {:?} and {:?}",
                self.image.dim(),
                other.image.dim()
            )));
        }
        self.image -= &other.image;
        self.variance += &other.variance;
        ndarray::Zip::from(&mut self.mask)
            .and(&other.mask)
            .for_each(|m, &o| *m |= o);
        Ok(())
    }

    /// Add a scalar to the intensity plane.
    pub fn add_scalar(&mut self, value: f64) {
        if value != 0.0 {
            self.image += value;
        }
    }

    /// Scale intensities by `value`; the variance scales by `value²`.
    pub fn scale(&mut self, value: f64) {
        self.image *= value;
        self.variance *= value * value;
    }
}
