//! Per-region Gaussian blur for detected faces.
//!
//! Only the face regions are touched; the rest of the frame stays
//! sharp so the upstream model can still reason about the scene.

use image::RgbImage;

use super::detector::FaceBox;

/// Blur every face region in place.
///
/// The blur strength scales with the region's short side so close-up
/// faces are unrecognizable too, with `min_radius` as the floor.
pub fn blur_faces(image: &mut RgbImage, faces: &[FaceBox], min_radius: u32) {
    for face in faces {
        blur_region(image, face, min_radius);
    }
}

fn blur_region(image: &mut RgbImage, face: &FaceBox, min_radius: u32) {
    let (img_w, img_h) = image.dimensions();
    if img_w == 0 || img_h == 0 {
        return;
    }

    // Clamp the box to the frame; detectors occasionally report boxes
    // that bleed past the edge.
    let x = face.x.min(img_w.saturating_sub(1));
    let y = face.y.min(img_h.saturating_sub(1));
    let w = face.width.min(img_w - x);
    let h = face.height.min(img_h - y);
    if w == 0 || h == 0 {
        return;
    }

    let radius = blur_radius(w, h, min_radius);
    let region = image::imageops::crop_imm(image, x, y, w, h).to_image();
    let blurred = image::imageops::blur(&region, radius as f32);
    image::imageops::replace(image, &blurred, x as i64, y as i64);
}

/// Radius proportional to the region's short side, floored.
pub fn blur_radius(width: u32, height: u32, min_radius: u32) -> u32 {
    (width.min(height) / 4).max(min_radius)
}
