//! Transformer capability consumed by warped maps
//!
//! The engine only needs `transform(point) -> point` from resource pixels to
//! geo coordinates. [`AffineTransformerBuilder`] covers the linear families so
//! the engine is usable on its own; higher order transformations are plugged in
//! through [`TransformerBuilder`].

use std::sync::Arc;

use thiserror::Error;

use crate::geometry::Point;

use super::georef::{Gcp, TransformationType};

/// Errors from building or evaluating a transformer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("{kind:?} needs at least {required} GCPs, got {got}")]
    NotEnoughGcps {
        kind: TransformationType,
        required: usize,
        got: usize,
    },

    #[error("GCPs are degenerate for {0:?} (coincident or collinear points)")]
    Degenerate(TransformationType),

    #[error("transformation {0:?} is not supported by this builder")]
    Unsupported(TransformationType),

    #[error("point ({x}, {y}) is outside the transformer domain")]
    OutOfDomain { x: f64, y: f64 },
}

/// Maps resource pixels to geo coordinates.
pub trait Transformer: Send + Sync {
    fn transform(&self, point: Point) -> Result<Point, TransformError>;
}

/// Builds transformers from GCPs.
pub trait TransformerBuilder: Send + Sync {
    fn build(
        &self,
        gcps: &[Gcp],
        kind: TransformationType,
    ) -> Result<Arc<dyn Transformer>, TransformError>;
}

/// Wraps a closure as a [`Transformer`].
pub struct FnTransformer<F>(pub F);

impl<F> Transformer for FnTransformer<F>
where
    F: Fn(Point) -> Result<Point, TransformError> + Send + Sync,
{
    fn transform(&self, point: Point) -> Result<Point, TransformError> {
        (self.0)(point)
    }
}

/// Affine transform fitted to GCPs. `geo = (a*x + b*y + c, d*x + e*y + f)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransformer {
    coefficients: [f64; 6],
}

impl AffineTransformer {
    pub fn coefficients(&self) -> [f64; 6] {
        self.coefficients
    }
}

impl Transformer for AffineTransformer {
    fn transform(&self, p: Point) -> Result<Point, TransformError> {
        let [a, b, c, d, e, f] = self.coefficients;
        let out = Point::new(a * p.x + b * p.y + c, d * p.x + e * p.y + f);
        if out.is_finite() {
            Ok(out)
        } else {
            Err(TransformError::OutOfDomain { x: p.x, y: p.y })
        }
    }
}

/// Builds straight, Helmert and first order polynomial transformers.
///
/// Straight and Helmert treat resource space as y-down and geo space as y-up,
/// so a map fitted with them comes out north-up.
#[derive(Clone, Copy, Debug, Default)]
pub struct AffineTransformerBuilder;

impl TransformerBuilder for AffineTransformerBuilder {
    fn build(
        &self,
        gcps: &[Gcp],
        kind: TransformationType,
    ) -> Result<Arc<dyn Transformer>, TransformError> {
        let transformer = match kind {
            TransformationType::Straight => fit_similarity(gcps, kind, false)?,
            TransformationType::Helmert => fit_similarity(gcps, kind, true)?,
            TransformationType::Polynomial(1) => fit_affine(gcps, kind)?,
            other => return Err(TransformError::Unsupported(other)),
        };
        Ok(Arc::new(transformer))
    }
}

fn require(gcps: &[Gcp], kind: TransformationType, required: usize) -> Result<(), TransformError> {
    if gcps.len() < required {
        return Err(TransformError::NotEnoughGcps {
            kind,
            required,
            got: gcps.len(),
        });
    }
    Ok(())
}

fn centroids(gcps: &[Gcp]) -> (Point, Point) {
    let n = gcps.len() as f64;
    let (mut r, mut g) = (Point::default(), Point::default());
    for gcp in gcps {
        r = r + gcp.resource;
        g = g + gcp.geo;
    }
    (r * (1.0 / n), g * (1.0 / n))
}

/// Least squares similarity on `(x, -y)`; without rotation when `rotate` is false.
fn fit_similarity(
    gcps: &[Gcp],
    kind: TransformationType,
    rotate: bool,
) -> Result<AffineTransformer, TransformError> {
    require(gcps, kind, 2)?;
    let (rc, gc) = centroids(gcps);

    let (mut dot, mut cross, mut norm) = (0.0, 0.0, 0.0);
    for gcp in gcps {
        let r = Point::new(gcp.resource.x - rc.x, -(gcp.resource.y - rc.y));
        let g = gcp.geo - gc;
        dot += r.x * g.x + r.y * g.y;
        cross += r.x * g.y - r.y * g.x;
        norm += r.x * r.x + r.y * r.y;
    }
    if norm < 1e-12 {
        return Err(TransformError::Degenerate(kind));
    }

    let s_cos = dot / norm;
    let s_sin = if rotate { cross / norm } else { 0.0 };
    if s_cos.abs() < 1e-300 && s_sin.abs() < 1e-300 {
        return Err(TransformError::Degenerate(kind));
    }

    // geo = R * (x, -y) + t, expanded into the (x, y) coefficients
    let a = s_cos;
    let b = s_sin;
    let d = s_sin;
    let e = -s_cos;
    let c = gc.x - (a * rc.x + b * rc.y);
    let f = gc.y - (d * rc.x + e * rc.y);

    Ok(AffineTransformer {
        coefficients: [a, b, c, d, e, f],
    })
}

/// Least squares affine fit through the normal equations.
fn fit_affine(gcps: &[Gcp], kind: TransformationType) -> Result<AffineTransformer, TransformError> {
    require(gcps, kind, 3)?;
    let (rc, gc) = centroids(gcps);

    // Centered normal equations decouple the translation.
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    let (mut sxu, mut syu, mut sxv, mut syv) = (0.0, 0.0, 0.0, 0.0);
    for gcp in gcps {
        let x = gcp.resource.x - rc.x;
        let y = gcp.resource.y - rc.y;
        let u = gcp.geo.x - gc.x;
        let v = gcp.geo.y - gc.y;
        sxx += x * x;
        sxy += x * y;
        syy += y * y;
        sxu += x * u;
        syu += y * u;
        sxv += x * v;
        syv += y * v;
    }

    let det = sxx * syy - sxy * sxy;
    let scale = (sxx * syy).max(f64::MIN_POSITIVE);
    if det.abs() <= 1e-12 * scale {
        return Err(TransformError::Degenerate(kind));
    }

    let a = (sxu * syy - syu * sxy) / det;
    let b = (syu * sxx - sxu * sxy) / det;
    let d = (sxv * syy - syv * sxy) / det;
    let e = (syv * sxx - sxv * sxy) / det;
    let c = gc.x - a * rc.x - b * rc.y;
    let f = gc.y - d * rc.x - e * rc.y;

    Ok(AffineTransformer {
        coefficients: [a, b, c, d, e, f],
    })
}
