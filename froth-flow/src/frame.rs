//! # Frame buffers and regions

use crate::prelude::v1::*;
use bytemuck::{Pod, Zeroable};
use nalgebra as na;
use serde::{Deserialize, Serialize};

/// Number of channels in a [`Frame`] buffer.
pub const FRAME_CHANNELS: usize = 3;

/// BGR colour structure, in native OpenCV channel order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Bgr {
    pub b: u8,
    pub g: u8,
    pub r: u8,
}

impl Bgr {
    /// Convert from a slice containing `[b, g, r]` elements.
    pub fn from_bgr_slice(bgr: &[u8]) -> Self {
        Self {
            b: bgr[0],
            g: bgr[1],
            r: bgr[2],
        }
    }
}

/// Owned 8-bit BGR frame buffer.
///
/// Frames are row-major with [`FRAME_CHANNELS`] bytes per pixel. A frame is
/// immutable once produced by a capture source; arrival order is implicit in
/// the delivery sequence.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: usize,
    height: usize,
}

impl Frame {
    /// Create a frame from a raw BGR buffer.
    ///
    /// # Arguments
    ///
    /// * `data` - row-major BGR bytes, `width * height * 3` of them.
    /// * `width` - frame width in pixels.
    /// * `height` - frame height in pixels.
    pub fn new(data: Vec<u8>, width: usize, height: usize) -> Result<Self> {
        if data.len() != width * height * FRAME_CHANNELS {
            return Err(anyhow!(
                "frame buffer size {} does not match {}x{}x{}",
                data.len(),
                width,
                height,
                FRAME_CHANNELS
            ));
        }

        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Create a frame filled with a single colour.
    pub fn filled(width: usize, height: usize, pixel: Bgr) -> Self {
        let mut data = Vec::with_capacity(width * height * FRAME_CHANNELS);

        for _ in 0..width * height {
            data.extend_from_slice(&[pixel.b, pixel.g, pixel.r]);
        }

        Self {
            data,
            width,
            height,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Raw row-major BGR bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get the pixel at the given coordinates.
    pub fn pixel(&self, x: usize, y: usize) -> Option<Bgr> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let off = (y * self.width + x) * FRAME_CHANNELS;
        Some(Bgr::from_bgr_slice(&self.data[off..off + FRAME_CHANNELS]))
    }

    /// Overwrite the pixel at the given coordinates.
    ///
    /// Out-of-bounds coordinates are ignored.
    pub fn put_pixel(&mut self, x: usize, y: usize, pixel: Bgr) {
        if x < self.width && y < self.height {
            let off = (y * self.width + x) * FRAME_CHANNELS;
            self.data[off..off + FRAME_CHANNELS].copy_from_slice(&[pixel.b, pixel.g, pixel.r]);
        }
    }

    /// Crop the frame to the given region.
    ///
    /// The rectangle is clamped to the frame bounds. Returns `None` for an
    /// invalid rectangle, or when the clamped intersection is empty.
    pub fn crop(&self, rect: RoiRect) -> Option<Frame> {
        if !rect.is_valid() {
            return None;
        }

        let x0 = rect.x as usize;
        let y0 = rect.y as usize;

        if x0 >= self.width || y0 >= self.height {
            return None;
        }

        let x1 = (x0 + rect.width as usize).min(self.width);
        let y1 = (y0 + rect.height as usize).min(self.height);

        let width = x1 - x0;
        let height = y1 - y0;
        let mut data = Vec::with_capacity(width * height * FRAME_CHANNELS);

        for y in y0..y1 {
            let off = (y * self.width + x0) * FRAME_CHANNELS;
            data.extend_from_slice(&self.data[off..off + width * FRAME_CHANNELS]);
        }

        Some(Frame {
            data,
            width,
            height,
        })
    }
}

/// Rectangular tracked region of a frame.
///
/// The rectangle lives in the coordinate space of the frames handed to the
/// tracking pipeline. A rectangle is valid only with a non-negative origin and
/// strictly positive dimensions; invalid rectangles are silently skipped each
/// frame rather than cropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl RoiRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether the rectangle may be cropped and processed.
    pub fn is_valid(&self) -> bool {
        self.x >= 0 && self.y >= 0 && self.width > 0 && self.height > 0
    }

    /// Centre point of the rectangle.
    pub fn center(&self) -> na::Point2<f32> {
        na::Point2::new(
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }
}
