//! Detection overlay: one stroked rectangle per face on a transparent layer.

use crate::types::{BoundingBox, DetectionResult};
use image::{Rgba, RgbaImage};

/// Stroke style for detection boxes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayStyle {
    pub color: Rgba<u8>,
    pub line_width: u32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            color: Rgba([0x25, 0x63, 0xeb, 0xff]),
            line_width: 3,
        }
    }
}

/// Draws detection results onto a surface sized to the current frame.
///
/// Nothing carries over between renders except the allocation itself.
pub struct OverlayRenderer {
    style: OverlayStyle,
    surface: RgbaImage,
}

impl OverlayRenderer {
    pub fn new(style: OverlayStyle) -> Self {
        Self {
            style,
            surface: RgbaImage::new(0, 0),
        }
    }

    /// Render `result` for a `width`×`height` frame and return the layer.
    pub fn render(&mut self, result: &DetectionResult, width: u32, height: u32) -> &RgbaImage {
        if self.surface.dimensions() != (width, height) {
            self.surface = RgbaImage::new(width, height);
        } else {
            self.surface.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
        }

        // Boxes computed on a different mode are rescaled to this frame.
        let (sx, sy) = if result.frame_width > 0 && result.frame_height > 0 {
            (
                width as f32 / result.frame_width as f32,
                height as f32 / result.frame_height as f32,
            )
        } else {
            (1.0, 1.0)
        };

        for bbox in &result.detections {
            let scaled = BoundingBox {
                x: bbox.x * sx,
                y: bbox.y * sy,
                width: bbox.width * sx,
                height: bbox.height * sy,
                ..*bbox
            };
            stroke_rect(&mut self.surface, &scaled, &self.style);
        }
        &self.surface
    }

}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new(OverlayStyle::default())
    }
}

/// Stroke the outline of `bbox`, centred on its edges and clipped to `surface`.
fn stroke_rect(surface: &mut RgbaImage, bbox: &BoundingBox, style: &OverlayStyle) {
    let (w, h) = (surface.width() as i64, surface.height() as i64);
    if w == 0 || h == 0 || style.line_width == 0 {
        return;
    }

    let half = (style.line_width / 2) as i64;
    let lw = style.line_width as i64;
    // Out-of-range detector output saturates in the cast; pin it just outside
    // the surface so the stroke arithmetic below cannot overflow.
    let pin_x = |v: f32| (v.round() as i64).clamp(-lw, w + lw);
    let pin_y = |v: f32| (v.round() as i64).clamp(-lw, h + lw);
    let (x0, x1) = (pin_x(bbox.x), pin_x(bbox.x + bbox.width));
    let (y0, y1) = (pin_y(bbox.y), pin_y(bbox.y + bbox.height));

    let mut fill = |xa: i64, ya: i64, xb: i64, yb: i64| {
        for y in ya.max(0)..=yb.min(h - 1) {
            for x in xa.max(0)..=xb.min(w - 1) {
                surface.put_pixel(x as u32, y as u32, style.color);
            }
        }
    };

    fill(x0 - half, y0 - half, x1 - half + lw - 1, y0 - half + lw - 1); // top
    fill(x0 - half, y1 - half, x1 - half + lw - 1, y1 - half + lw - 1); // bottom
    fill(x0 - half, y0 - half, x0 - half + lw - 1, y1 - half + lw - 1); // left
    fill(x1 - half, y0 - half, x1 - half + lw - 1, y1 - half + lw - 1); // right
}
