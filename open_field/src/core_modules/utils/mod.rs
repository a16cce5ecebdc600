pub mod image_helper;
pub mod mat_helper;
