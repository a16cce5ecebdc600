use image::{ImageEncoder, RgbImage};
use std::path::Path;

/// Writes an RGB frame as PNG.
pub fn save_png(path: impl AsRef<Path>, image: &RgbImage) -> Result<(), image::error::ImageError> {
    let output = std::io::BufWriter::new(std::fs::File::create(path)?);
    let encoder = image::codecs::png::PngEncoder::new(output);

    encoder.write_image(image.as_raw(), image.width(), image.height(), image::ExtendedColorType::Rgb8)?;

    Ok(())
}
