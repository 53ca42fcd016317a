//! Per-map render options and the per-pixel color pipeline
//!
//! The same math is mirrored in the GPU fragment shader (`shader/warp.wgsl`).

/// Treat pixels close to a reference color as transparent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemoveBackground {
    pub color: [u8; 3],
    /// Normalized RGB distance (0..1) below which pixels are removed
    pub threshold: f32,
    /// 1.0 gives a hard cut, lower values fade alpha in over part of the threshold band
    pub hardness: f32,
}

/// Blend pixel colors toward a target color.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Colorize {
    pub color: [u8; 3],
    pub strength: f32,
}

impl Colorize {
    pub fn new(color: [u8; 3]) -> Self {
        Self {
            color,
            strength: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderOptions {
    pub visible: bool,
    pub opacity: f32,
    pub remove_background: Option<RemoveBackground>,
    pub colorize: Option<Colorize>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            visible: true,
            opacity: 1.0,
            remove_background: None,
            colorize: None,
        }
    }
}

impl RenderOptions {
    /// Run a straight-alpha RGBA8 texel through the effects.
    ///
    /// Returns straight-alpha RGBA in 0..1.
    pub fn shade(&self, texel: [u8; 4]) -> [f32; 4] {
        let mut rgb = [
            texel[0] as f32 / 255.0,
            texel[1] as f32 / 255.0,
            texel[2] as f32 / 255.0,
        ];
        let mut alpha = texel[3] as f32 / 255.0;

        if let Some(remove) = &self.remove_background {
            alpha *= background_alpha(rgb, remove);
        }

        if let Some(colorize) = &self.colorize {
            let strength = colorize.strength.clamp(0.0, 1.0);
            for (channel, target) in rgb.iter_mut().zip(colorize.color) {
                let target = target as f32 / 255.0;
                *channel += (target - *channel) * strength;
            }
        }

        alpha *= self.opacity.clamp(0.0, 1.0);
        [rgb[0], rgb[1], rgb[2], alpha]
    }
}

/// Alpha multiplier for background removal.
fn background_alpha(rgb: [f32; 3], remove: &RemoveBackground) -> f32 {
    let dr = rgb[0] - remove.color[0] as f32 / 255.0;
    let dg = rgb[1] - remove.color[1] as f32 / 255.0;
    let db = rgb[2] - remove.color[2] as f32 / 255.0;
    let distance = (dr * dr + dg * dg + db * db).sqrt() / 3f32.sqrt();

    let threshold = remove.threshold.clamp(0.0, 1.0);
    let inner = threshold * remove.hardness.clamp(0.0, 1.0);
    if distance >= threshold {
        1.0
    } else if distance <= inner || threshold <= inner {
        0.0
    } else {
        (distance - inner) / (threshold - inner)
    }
}

/// Source-over blend of straight-alpha `src` onto a straight-alpha RGBA8 pixel.
pub fn blend_over(dst: &mut [u8], src: [f32; 4]) {
    let sa = src[3];
    if sa <= 0.0 {
        return;
    }
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    if out_a <= 0.0 {
        return;
    }
    for c in 0..3 {
        let dc = dst[c] as f32 / 255.0;
        let out = (src[c] * sa + dc * da * (1.0 - sa)) / out_a;
        dst[c] = (out.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    dst[3] = (out_a.clamp(0.0, 1.0) * 255.0).round() as u8;
}
