//! Minimal 5×7 bitmap font for the on-screen counter.
//!
//! Only the glyphs the overlay needs; anything else renders as a blank cell.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
/// Horizontal gap between glyphs, in font pixels.
const GLYPH_SPACING: u32 = 1;

/// Row bitmaps, top to bottom; bit 4 is the leftmost column.
fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        _ => [0; 7],
    }
}

/// Draw `text` with its top-left corner at (x, y). Clipped at the image edges.
pub fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>, scale: u32) {
    let scale = scale.max(1);
    let advance = ((GLYPH_WIDTH + GLYPH_SPACING) * scale) as i32;

    for (i, c) in text.chars().enumerate() {
        let origin_x = x + i as i32 * advance;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                let px = origin_x + (col * scale) as i32;
                let py = y + (row as u32 * scale) as i32;
                draw_filled_rect_mut(image, Rect::at(px, py).of_size(scale, scale), color);
            }
        }
    }
}

pub const fn line_height(scale: u32) -> u32 {
    GLYPH_HEIGHT * scale
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

    #[test]
    fn test_draw_single_glyph() {
        let mut image = RgbImage::new(10, 10);
        draw_text(&mut image, 0, 0, "1", WHITE, 1);
        // '1' row 0 is 0x04: only the centre column is lit.
        assert_eq!(image.get_pixel(2, 0), &WHITE);
        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
        // Bottom row 0x0E spans columns 1..=3.
        assert_eq!(image.get_pixel(1, 6), &WHITE);
        assert_eq!(image.get_pixel(3, 6), &WHITE);
        assert_eq!(image.get_pixel(4, 6), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_is_clipped() {
        let mut image = RgbImage::new(8, 4);
        draw_text(&mut image, 4, 2, "BLINKS: 10", WHITE, 3);
        draw_text(&mut image, -20, -20, "8", WHITE, 1);
        assert_eq!(image.dimensions(), (8, 4));
    }

    #[test]
    fn test_unknown_glyph_is_blank() {
        let mut image = RgbImage::new(6, 7);
        draw_text(&mut image, 0, 0, "?", WHITE, 1);
        assert!(image.pixels().all(|p| *p == Rgb([0, 0, 0])));
        assert_eq!(line_height(2), 14);
    }
}
