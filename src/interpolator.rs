use nalgebra::Vector3;
use ndarray::Array3;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Trilinear sample at a continuous (x, y, z) index.
    ///
    /// Returns `None` outside `[0, n - 1]` on any axis.
    #[inline]
    pub(crate) fn trilinear_interpolate(data: &Array3<f32>, index: &Vector3<f64>) -> Option<f32> {
        let (depth, height, width) = data.dim();
        let (x, y, z) = (index.x, index.y, index.z);
        if !Self::inside(x, width) || !Self::inside(y, height) || !Self::inside(z, depth) {
            return None;
        }

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let z0 = z.floor() as usize;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let z1 = (z0 + 1).min(depth - 1);

        let dx = (x - x0 as f64) as f32;
        let dy = (y - y0 as f64) as f32;
        let dz = (z - z0 as f64) as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;
        let one_minus_dz = 1.0 - dz;

        let lerp_x = |zi: usize, yi: usize| {
            data[[zi, yi, x0]].mul_add(one_minus_dx, data[[zi, yi, x1]] * dx)
        };

        let c00 = lerp_x(z0, y0);
        let c01 = lerp_x(z0, y1);
        let c10 = lerp_x(z1, y0);
        let c11 = lerp_x(z1, y1);

        let c0 = c00.mul_add(one_minus_dy, c01 * dy);
        let c1 = c10.mul_add(one_minus_dy, c11 * dy);

        Some(c0.mul_add(one_minus_dz, c1 * dz))
    }

    #[inline]
    fn inside(coordinate: f64, len: usize) -> bool {
        coordinate >= 0.0 && coordinate <= (len - 1) as f64
    }

    /// Parameter interval `[t_min, t_max]` where `start + t * delta` lies in
    /// the box `[0, n - 1]` (slab method). `None` if the line misses.
    pub(crate) fn clip_line_to_grid(
        start: &Vector3<f64>,
        delta: &Vector3<f64>,
        dim: (usize, usize, usize),
    ) -> Option<(f64, f64)> {
        let (depth, height, width) = dim;
        let upper = Vector3::new(
            (width - 1) as f64,
            (height - 1) as f64,
            (depth - 1) as f64,
        );

        let mut t_min = f64::NEG_INFINITY;
        let mut t_max = f64::INFINITY;
        for axis in 0..3 {
            if delta[axis].abs() < f64::EPSILON {
                if start[axis] < 0.0 || start[axis] > upper[axis] {
                    return None;
                }
                continue;
            }
            let t0 = -start[axis] / delta[axis];
            let t1 = (upper[axis] - start[axis]) / delta[axis];
            t_min = t_min.max(t0.min(t1));
            t_max = t_max.min(t0.max(t1));
        }

        (t_min.is_finite() && t_max.is_finite() && t_min <= t_max).then_some((t_min, t_max))
    }

    /// Line integral of the voxel values above `threshold` along the line
    /// through two index-space points, clipped to the grid.
    ///
    /// `physical_length` is the physical distance between `start` and `end`;
    /// the result is in intensity times physical length. Each sample
    /// contributes `value - threshold` when `value > threshold`.
    pub(crate) fn ray_integral(
        data: &Array3<f32>,
        start: &Vector3<f64>,
        end: &Vector3<f64>,
        physical_length: f64,
        threshold: f64,
    ) -> Option<f64> {
        let delta = end - start;
        let (t_min, t_max) = Self::clip_line_to_grid(start, &delta, data.dim())?;

        let span = delta * (t_max - t_min);
        // at most one voxel per step along any axis
        let steps = span.amax().ceil().max(1.0) as usize;
        let dt = (t_max - t_min) / steps as f64;
        let step_length = physical_length * dt.abs();

        let mut integral = 0.0;
        for step in 0..steps {
            let t = t_min + (step as f64 + 0.5) * dt;
            let index = start + delta * t;
            if let Some(value) = Self::trilinear_interpolate(data, &index) {
                let value = value as f64;
                if value > threshold {
                    integral += value - threshold;
                }
            }
        }

        Some(integral * step_length)
    }
}
