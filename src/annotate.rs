//! Draws detection boxes onto frames before they are streamed.

use crate::detect::Detection;
use crate::frame::{Frame, PixelFormat};

/// Box palette in BGR order, picked by `class_id % 19`.
const PALETTE_BGR: [[u8; 3]; 19] = [
    [54, 67, 244],
    [99, 30, 233],
    [176, 39, 156],
    [183, 58, 103],
    [181, 81, 63],
    [243, 150, 33],
    [244, 169, 3],
    [212, 188, 0],
    [136, 150, 0],
    [80, 175, 76],
    [74, 195, 139],
    [57, 220, 205],
    [59, 235, 255],
    [7, 193, 255],
    [0, 152, 255],
    [34, 87, 255],
    [72, 85, 121],
    [158, 158, 158],
    [139, 125, 96],
];

const LINE_WIDTH: i32 = 2;
const TAB_HEIGHT: i32 = 6;
const TAB_CHAR_WIDTH: i32 = 6;

pub fn class_color(class_id: i32) -> [u8; 3] {
    PALETTE_BGR[class_id.rem_euclid(PALETTE_BGR.len() as i32) as usize]
}

/// Outline every detection and mark its top edge with a solid tab sized to
/// the label. Grey frames are left untouched.
pub fn draw_detections(frame: &mut Frame, detections: &[Detection]) {
    if frame.format == PixelFormat::Gray8 {
        return;
    }
    for det in detections {
        let color = class_color(det.class_id);
        let left = det.bbox.x.round() as i32;
        let top = det.bbox.y.round() as i32;
        let right = det.bbox.right().round() as i32;
        let bottom = det.bbox.bottom().round() as i32;
        draw_rectangle(frame, left, top, right, bottom, color);

        let tab_width = det.label.len() as i32 * TAB_CHAR_WIDTH;
        let tab_top = (top - TAB_HEIGHT).max(0);
        fill_rect(frame, left, tab_top, left + tab_width, tab_top + TAB_HEIGHT, color);
    }
}

fn draw_rectangle(frame: &mut Frame, left: i32, top: i32, right: i32, bottom: i32, color: [u8; 3]) {
    for offset in 0..LINE_WIDTH {
        fill_rect(frame, left, top + offset, right, top + offset, color);
        fill_rect(frame, left, bottom - offset, right, bottom - offset, color);
        fill_rect(frame, left + offset, top, left + offset, bottom, color);
        fill_rect(frame, right - offset, top, right - offset, bottom, color);
    }
}

/// Inclusive fill, clipped to the frame.
fn fill_rect(frame: &mut Frame, left: i32, top: i32, right: i32, bottom: i32, color: [u8; 3]) {
    let width = frame.width as i32;
    let height = frame.height as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);
    if right < left || bottom < top {
        return;
    }
    let format = frame.format;
    let bpp = format.bytes_per_pixel();
    let stride = frame.width as usize * bpp;
    let pixels = frame.pixels_mut();
    for y in top as usize..=bottom as usize {
        for x in left as usize..=right as usize {
            let idx = y * stride + x * bpp;
            put_pixel(&mut pixels[idx..idx + bpp], format, color);
        }
    }
}

fn put_pixel(px: &mut [u8], format: PixelFormat, bgr: [u8; 3]) {
    match format {
        PixelFormat::Bgr24 | PixelFormat::Bgra32 => px[..3].copy_from_slice(&bgr),
        PixelFormat::Rgb24 => px.copy_from_slice(&[bgr[2], bgr[1], bgr[0]]),
        PixelFormat::Gray8 => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::labels::class_name;
    use anyhow::Result;

    fn person(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            class_id: 0,
            label: class_name(0),
            confidence: 0.9,
            bbox: BoundingBox {
                x,
                y,
                width: w,
                height: h,
            },
        }
    }

    fn pixel(frame: &Frame, x: usize, y: usize) -> &[u8] {
        let bpp = frame.format.bytes_per_pixel();
        let idx = (y * frame.width as usize + x) * bpp;
        &frame.pixels()[idx..idx + bpp]
    }

    #[test]
    fn outlines_box_without_filling_it() -> Result<()> {
        let mut frame = Frame::filled(100, 100, PixelFormat::Bgr24, 0)?;
        draw_detections(&mut frame, &[person(20.0, 30.0, 40.0, 40.0)]);
        assert_eq!(pixel(&frame, 20, 50), &PALETTE_BGR[0]);
        assert_eq!(pixel(&frame, 60, 50), &PALETTE_BGR[0]);
        assert_eq!(pixel(&frame, 40, 50), &[0, 0, 0]);
        Ok(())
    }

    #[test]
    fn rgb_frames_get_swapped_colour() -> Result<()> {
        let mut frame = Frame::filled(50, 50, PixelFormat::Rgb24, 0)?;
        draw_detections(&mut frame, &[person(10.0, 10.0, 20.0, 20.0)]);
        let [b, g, r] = PALETTE_BGR[0];
        assert_eq!(pixel(&frame, 10, 20), &[r, g, b]);
        Ok(())
    }

    #[test]
    fn boxes_touching_the_edge_are_clipped() -> Result<()> {
        let mut frame = Frame::filled(32, 32, PixelFormat::Bgra32, 7)?;
        draw_detections(&mut frame, &[person(0.0, 0.0, 31.0, 31.0)]);
        assert_eq!(&pixel(&frame, 31, 31)[..3], &PALETTE_BGR[0]);
        assert_eq!(pixel(&frame, 31, 31)[3], 7);
        Ok(())
    }

    #[test]
    fn palette_wraps_by_class() {
        assert_eq!(class_color(19), class_color(0));
        assert_eq!(class_color(-1), class_color(18));
    }
}
