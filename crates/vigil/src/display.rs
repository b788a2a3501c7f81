//! Preview window: camera frame, landmark dots and the drowsiness event count.
//!
//! ESC, `q` or closing the window requests shutdown. With the display disabled
//! the loop runs headless and only stops on a fatal capture error or a signal.

use crate::font;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use minifb::{Key, Window, WindowOptions};
use std::convert::Infallible;
use thiserror::Error;
use vigil_core::{Frame, LandmarkSet, QuitSignal, Renderer};

const WINDOW_TITLE: &str = "vigil";
const TARGET_FPS: usize = 30;
const LANDMARK_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LANDMARK_RADIUS: i32 = 1;
const COUNTER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const COUNTER_SCALE: u32 = 2;
const COUNTER_ORIGIN: (i32, i32) = (10, 16);

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("failed to open window: {0}")]
    Open(String),
    #[error("failed to update window: {0}")]
    Update(String),
}

/// Compose the overlay image for one frame.
pub fn compose(frame: &Frame, landmarks: Option<&LandmarkSet>, blink_count: u64) -> RgbImage {
    let width = frame.width as usize;
    let mut image = RgbImage::from_fn(frame.width, frame.height, |x, y| {
        let v = frame
            .data
            .get(y as usize * width + x as usize)
            .copied()
            .unwrap_or(0);
        Rgb([v, v, v])
    });

    if let Some(landmarks) = landmarks {
        for p in &landmarks.points {
            draw_filled_circle_mut(
                &mut image,
                (p.x.round() as i32, p.y.round() as i32),
                LANDMARK_RADIUS,
                LANDMARK_COLOR,
            );
        }
    }

    font::draw_text(
        &mut image,
        COUNTER_ORIGIN.0,
        COUNTER_ORIGIN.1,
        &format!("BLINKS: {blink_count}"),
        COUNTER_COLOR,
        COUNTER_SCALE,
    );

    image
}

/// Pack RGB pixels into minifb's 0RGB u32 layout.
fn to_argb(image: &RgbImage) -> Vec<u32> {
    image
        .pixels()
        .map(|p| (u32::from(p[0]) << 16) | (u32::from(p[1]) << 8) | u32::from(p[2]))
        .collect()
}

pub struct WindowDisplay {
    window: Window,
}

impl WindowDisplay {
    pub fn open(width: u32, height: u32) -> Result<Self, DisplayError> {
        let mut window = Window::new(
            WINDOW_TITLE,
            width as usize,
            height as usize,
            WindowOptions::default(),
        )
        .map_err(|e| DisplayError::Open(e.to_string()))?;
        window.set_target_fps(TARGET_FPS);

        tracing::info!(width, height, "preview window opened");
        Ok(Self { window })
    }
}

impl Renderer for WindowDisplay {
    type Error = DisplayError;

    fn render(
        &mut self,
        frame: &Frame,
        landmarks: Option<&LandmarkSet>,
        blink_count: u64,
    ) -> Result<(), DisplayError> {
        let image = compose(frame, landmarks, blink_count);
        self.window
            .update_with_buffer(&to_argb(&image), image.width() as usize, image.height() as usize)
            .map_err(|e| DisplayError::Update(e.to_string()))
    }
}

impl QuitSignal for WindowDisplay {
    fn quit_requested(&mut self) -> bool {
        !self.window.is_open()
            || self.window.is_key_down(Key::Escape)
            || self.window.is_key_down(Key::Q)
    }
}

/// No window. Logs the counter when it changes.
#[derive(Default)]
pub struct HeadlessDisplay {
    last_count: u64,
}

impl Renderer for HeadlessDisplay {
    type Error = Infallible;

    fn render(
        &mut self,
        _frame: &Frame,
        _landmarks: Option<&LandmarkSet>,
        blink_count: u64,
    ) -> Result<(), Infallible> {
        if blink_count != self.last_count {
            tracing::info!(blink_count, "drowsiness events");
            self.last_count = blink_count;
        }
        Ok(())
    }
}

impl QuitSignal for HeadlessDisplay {
    fn quit_requested(&mut self) -> bool {
        false
    }
}

/// The display chosen at startup.
pub enum Display {
    Window(WindowDisplay),
    Headless(HeadlessDisplay),
}

impl Renderer for Display {
    type Error = DisplayError;

    fn render(
        &mut self,
        frame: &Frame,
        landmarks: Option<&LandmarkSet>,
        blink_count: u64,
    ) -> Result<(), DisplayError> {
        match self {
            Display::Window(window) => window.render(frame, landmarks, blink_count),
            Display::Headless(headless) => match headless.render(frame, landmarks, blink_count) {
                Ok(()) => Ok(()),
                Err(never) => match never {},
            },
        }
    }
}

impl QuitSignal for Display {
    fn quit_requested(&mut self) -> bool {
        match self {
            Display::Window(window) => window.quit_requested(),
            Display::Headless(headless) => headless.quit_requested(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use vigil_core::Point;

    fn frame(width: u32, height: u32, value: u8) -> Frame {
        Frame {
            data: vec![value; (width * height) as usize],
            width,
            height,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    #[test]
    fn test_compose_copies_gray() {
        let image = compose(&frame(120, 80, 77), None, 0);
        assert_eq!(image.dimensions(), (120, 80));
        assert_eq!(image.get_pixel(119, 79), &Rgb([77, 77, 77]));
    }

    #[test]
    fn test_compose_draws_landmarks() {
        let landmarks = LandmarkSet::new(vec![Point::new(100.0, 60.0)]);
        let image = compose(&frame(120, 80, 0), Some(&landmarks), 0);
        assert_eq!(image.get_pixel(100, 60), &LANDMARK_COLOR);
    }

    #[test]
    fn test_compose_draws_counter() {
        let image = compose(&frame(200, 60, 0), None, 3);
        let lit = image.pixels().filter(|p| **p == COUNTER_COLOR).count();
        assert!(lit > 0);
        // Nothing drawn below the text line.
        let text_bottom = COUNTER_ORIGIN.1 as u32 + font::line_height(COUNTER_SCALE);
        assert!((text_bottom..60).all(|y| (0..200).all(|x| image.get_pixel(x, y) != &COUNTER_COLOR)));
    }

    #[test]
    fn test_short_frame_data_is_black() {
        let mut f = frame(4, 4, 200);
        f.data.truncate(8);
        let image = compose(&f, None, 0);
        assert_eq!(image.get_pixel(0, 0), &Rgb([200, 200, 200]));
        assert_eq!(image.get_pixel(3, 3), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_to_argb() {
        let mut image = RgbImage::new(1, 1);
        image.put_pixel(0, 0, Rgb([0x12, 0x34, 0x56]));
        assert_eq!(to_argb(&image), vec![0x0012_3456]);
    }

    #[test]
    fn test_headless_never_quits() {
        let mut display = HeadlessDisplay::default();
        assert!(display.render(&frame(2, 2, 0), None, 1).is_ok());
        assert!(!display.quit_requested());
    }
}
