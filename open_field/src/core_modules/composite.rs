// THEORY:
// The behavior classifier looks at one image at a time but has to judge
// motion. The `composite` module folds a short clip into one RGB image: the
// red channel is the middle frame, the green channel is the average of the
// frames before it and the blue channel is the average of the frames after it.
// Anything that moved shows up as color fringes around the animal.
//
// Key architectural principles:
// 1.  **Bounded Window**: Frames live in a `VecDeque` that never grows past
//     `window_size`; the oldest frame is evicted before a new one is pushed.
// 2.  **Centered Output**: A composite is built only when the window is full,
//     and it describes the frame `window_size / 2` positions behind the newest.
//     Callers receive that index with the image so the delay is never implicit.
// 3.  **Fixed Geometry**: The first frame fixes the width and height; a frame of
//     another size is an error rather than a silent resize.

use crate::error::{FieldError, Result};
use image::RgbImage;
use std::collections::VecDeque;

pub const DEFAULT_WINDOW_SIZE: usize = 21;

/// A composite image and the index of the frame it is centered on.
#[derive(Debug, Clone)]
pub struct CompositeFrame {
    pub center_index: usize,
    pub image: RgbImage,
}

#[derive(Debug)]
pub struct CompositeFrameBuilder {
    window_size: usize,
    frames: VecDeque<RgbImage>,
    /// Index the next pushed frame will get.
    next_index: usize,
}

impl CompositeFrameBuilder {
    /// `window_size` must be odd and at least 3.
    pub fn new(window_size: usize) -> Result<Self> {
        if window_size < 3 || window_size % 2 == 0 {
            return Err(FieldError::Config(format!(
                "composite window must be odd and at least 3, got {window_size}"
            )));
        }
        Ok(Self {
            window_size,
            frames: VecDeque::with_capacity(window_size),
            next_index: 0,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Frames between a trigger frame and the frame its composite describes.
    pub fn shift(&self) -> usize {
        self.window_size / 2
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() == self.window_size
    }

    /// Adds a frame and returns a composite once the window is full.
    pub fn push(&mut self, frame: RgbImage) -> Result<Option<CompositeFrame>> {
        if let Some(first) = self.frames.front() {
            if first.dimensions() != frame.dimensions() {
                return Err(FieldError::FrameSizeMismatch {
                    width: first.width(),
                    height: first.height(),
                    got_width: frame.width(),
                    got_height: frame.height(),
                });
            }
        }

        if self.frames.len() == self.window_size {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        let trigger_index = self.next_index;
        self.next_index += 1;

        if !self.is_full() {
            return Ok(None);
        }
        Ok(Some(CompositeFrame {
            center_index: trigger_index - self.shift(),
            image: self.compose(),
        }))
    }

    /// Drops buffered frames and restarts the frame count.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.next_index = 0;
    }

    fn compose(&self) -> RgbImage {
        let half = self.shift();
        let center = &self.frames[half];
        let (width, height) = center.dimensions();
        let mut green_sum = vec![0u32; (width * height) as usize];
        let mut blue_sum = vec![0u32; (width * height) as usize];

        for frame in self.frames.iter().take(half) {
            for (sum, pixel) in green_sum.iter_mut().zip(frame.pixels()) {
                *sum += pixel[1] as u32;
            }
        }
        for frame in self.frames.iter().skip(half + 1) {
            for (sum, pixel) in blue_sum.iter_mut().zip(frame.pixels()) {
                *sum += pixel[2] as u32;
            }
        }

        let mut composite = center.clone();
        let count = half as f64;
        for (i, pixel) in composite.pixels_mut().enumerate() {
            pixel[1] = (green_sum[i] as f64 / count).round() as u8;
            pixel[2] = (blue_sum[i] as f64 / count).round() as u8;
        }
        composite
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(value: u8) -> RgbImage {
        RgbImage::from_pixel(4, 3, Rgb([value, value, value]))
    }

    #[test]
    fn rejects_even_or_tiny_windows() {
        assert!(CompositeFrameBuilder::new(4).is_err());
        assert!(CompositeFrameBuilder::new(1).is_err());
        assert!(CompositeFrameBuilder::new(3).is_ok());
    }

    #[test]
    fn emits_only_when_full() {
        let mut builder = CompositeFrameBuilder::new(5).expect("valid window");
        for i in 0..4 {
            assert!(builder.push(solid(i)).expect("push").is_none());
        }
        let composite = builder.push(solid(4)).expect("push").expect("window full");
        assert_eq!(composite.center_index, 2);
        let next = builder.push(solid(5)).expect("push").expect("window full");
        assert_eq!(next.center_index, 3);
    }

    #[test]
    fn channels_encode_past_center_and_future() {
        let mut builder = CompositeFrameBuilder::new(5).expect("valid window");
        let values = [10u8, 20, 100, 31, 50];
        let mut last = None;
        for value in values {
            last = builder.push(solid(value)).expect("push");
        }
        let composite = last.expect("window full");
        let pixel = composite.image.get_pixel(2, 1);
        assert_eq!(pixel[0], 100);
        assert_eq!(pixel[1], 15);
        // (31 + 50) / 2 = 40.5
        assert_eq!(pixel[2], 41);
    }

    #[test]
    fn frame_size_change_is_an_error() {
        let mut builder = CompositeFrameBuilder::new(3).expect("valid window");
        builder.push(solid(0)).expect("push");
        let err = builder.push(RgbImage::new(8, 8)).expect_err("size mismatch");
        assert!(matches!(err, FieldError::FrameSizeMismatch { width: 4, height: 3, got_width: 8, got_height: 8 }));
    }

    #[test]
    fn reset_empties_the_window() {
        let mut builder = CompositeFrameBuilder::new(3).expect("valid window");
        for value in 0..3 {
            builder.push(solid(value)).expect("push");
        }
        assert!(builder.is_full());
        builder.reset();
        assert!(!builder.is_full());
        assert!(builder.push(RgbImage::new(8, 8)).expect("new size after reset").is_none());
    }
}
