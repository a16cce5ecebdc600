use crate::error::CalibrationError;
use image::GrayImage;
use opencv::core::{self, Mat, Scalar};
use opencv::prelude::*;

/// Copies a grayscale buffer into a single-channel 8-bit `Mat`.
pub fn gray_to_mat(image: &GrayImage) -> Result<Mat, CalibrationError> {
    let mut mat = Mat::new_rows_cols_with_default(
        image.height() as i32,
        image.width() as i32,
        core::CV_8UC1,
        Scalar::all(0.0),
    )?;
    mat.data_bytes_mut()?.copy_from_slice(image.as_raw());
    Ok(mat)
}

/// Copies a continuous single-channel 8-bit `Mat` back into a grayscale buffer.
pub fn mat_to_gray(mat: &Mat) -> Result<GrayImage, CalibrationError> {
    let bytes = mat.data_bytes()?.to_vec();
    GrayImage::from_raw(mat.cols() as u32, mat.rows() as u32, bytes).ok_or_else(|| {
        CalibrationError::Vision(format!(
            "matrix of {}x{} is not a single-channel 8-bit image",
            mat.cols(),
            mat.rows()
        ))
    })
}
