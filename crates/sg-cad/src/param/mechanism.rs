//! Closed-form two-body mechanism solvers
//!
//! Both solvers have two algebraic roots. The one with the smaller magnitude
//! (slider travel, or follower angle from the reference direction) is taken,
//! the first root on a tie.

use std::f64::consts::PI;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use super::checked_acos;
use crate::error::{ExprResult, ExpressionError};
use crate::graph::{NodeId, Resolver, ScalarId, VectorId};
use crate::hash::HashBuilder;

const EPS: f64 = 1e-12;

/// Mechanism-driven point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mechanism {
    /// Pin of a slider on a straight guide, linked to a crank pin by a rod
    Slider {
        rod_length: ScalarId,
        crank_pin: VectorId,
        slider_origin: VectorId,
        slider_direction: VectorId,
    },
    /// Pin on a rotating follower, linked to a crank pin by a rod
    CrankDrive {
        rod_length: ScalarId,
        crank_pin: VectorId,
        follower_radius: ScalarId,
        follower_center: VectorId,
        follower_axis: VectorId,
    },
}

impl Mechanism {
    pub fn tag(&self) -> &'static str {
        match self {
            Mechanism::Slider { .. } => "vector/mechanism/slider",
            Mechanism::CrankDrive { .. } => "vector/mechanism/crank-drive",
        }
    }

    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Mechanism::Slider {
                rod_length,
                crank_pin,
                slider_origin,
                slider_direction,
            } => vec![
                rod_length.node(),
                crank_pin.node(),
                slider_origin.node(),
                slider_direction.node(),
            ],
            Mechanism::CrankDrive {
                rod_length,
                crank_pin,
                follower_radius,
                follower_center,
                follower_axis,
            } => vec![
                rod_length.node(),
                crank_pin.node(),
                follower_radius.node(),
                follower_center.node(),
                follower_axis.node(),
            ],
        }
    }

    pub(crate) fn hash_literals(&self, _h: &mut HashBuilder) {}

    pub fn evaluate(&self, inputs: &dyn Resolver, acos_tolerance: f64) -> ExprResult<DVec3> {
        match self {
            Mechanism::Slider {
                rod_length,
                crank_pin,
                slider_origin,
                slider_direction,
            } => slider_position(
                inputs.scalar_value(*rod_length)?,
                inputs.vector_value(*crank_pin)?,
                inputs.vector_value(*slider_origin)?,
                inputs.vector_value(*slider_direction)?,
            ),
            Mechanism::CrankDrive {
                rod_length,
                crank_pin,
                follower_radius,
                follower_center,
                follower_axis,
            } => crank_drive_position(
                inputs.scalar_value(*rod_length)?,
                inputs.vector_value(*crank_pin)?,
                inputs.scalar_value(*follower_radius)?,
                inputs.vector_value(*follower_center)?,
                inputs.vector_value(*follower_axis)?,
                acos_tolerance,
            ),
        }
    }
}

/// Of two roots, the one with the smaller magnitude (the first on a tie)
fn smaller_root(first: f64, second: f64) -> f64 {
    if second.abs() < first.abs() {
        second
    } else {
        first
    }
}

/// Wrap an angle from `(-2pi, 2pi]` into `(-pi, pi]`
fn wrap_angle(angle: f64) -> f64 {
    if angle > PI {
        angle - 2.0 * PI
    } else if angle <= -PI {
        angle + 2.0 * PI
    } else {
        angle
    }
}

/// Slider pin on the line `origin + t * direction` at distance `rod_length`
/// from `crank_pin`
pub fn slider_position(
    rod_length: f64,
    crank_pin: DVec3,
    origin: DVec3,
    direction: DVec3,
) -> ExprResult<DVec3> {
    let dir = direction.try_normalize().ok_or(ExpressionError::ZeroVector)?;
    let w = origin - crank_pin;

    // t^2 + 2 (w.d) t + |w|^2 - L^2 = 0
    let half_b = w.dot(dir);
    let c = w.length_squared() - rod_length * rod_length;
    let discriminant = half_b * half_b - c;
    if discriminant < 0.0 {
        return Err(ExpressionError::Unsolvable(format!(
            "rod of length {} cannot reach the slider guide",
            rod_length
        )));
    }

    let root = discriminant.sqrt();
    let t = smaller_root(-half_b + root, -half_b - root);
    Ok(origin + dir * t)
}

/// Follower pin on the circle of `radius` about `center` (plane normal `axis`)
/// at distance `rod_length` from `crank_pin`
///
/// Angles are measured from the projection of the global X axis into the
/// follower plane (Y if X is normal to it).
pub fn crank_drive_position(
    rod_length: f64,
    crank_pin: DVec3,
    radius: f64,
    center: DVec3,
    axis: DVec3,
    acos_tolerance: f64,
) -> ExprResult<DVec3> {
    let n = axis.try_normalize().ok_or(ExpressionError::ZeroVector)?;
    if radius <= EPS {
        return Err(ExpressionError::Unsolvable(
            "follower radius must be positive".into(),
        ));
    }

    let offset = crank_pin - center;
    let height = offset.dot(n);
    let in_plane = offset - n * height;
    let distance = in_plane.length();
    let reach_sq = rod_length * rod_length - height * height;
    if reach_sq < 0.0 {
        return Err(ExpressionError::Unsolvable(format!(
            "rod of length {} is shorter than the out-of-plane offset {}",
            rod_length,
            height.abs()
        )));
    }
    if distance < EPS {
        return Err(ExpressionError::Unsolvable(
            "crank pin lies on the follower axis".into(),
        ));
    }

    let e_ref = DVec3::X
        .reject_from_normalized(n)
        .try_normalize()
        .or_else(|| DVec3::Y.reject_from_normalized(n).try_normalize())
        .ok_or(ExpressionError::ZeroVector)?;
    let e_perp = n.cross(e_ref);

    let base = in_plane.dot(e_perp).atan2(in_plane.dot(e_ref));
    let ratio = (radius * radius + distance * distance - reach_sq) / (2.0 * radius * distance);
    let phi = checked_acos(ratio, acos_tolerance)?;

    let angle = smaller_root(wrap_angle(base + phi), wrap_angle(base - phi));
    Ok(center + radius * (angle.cos() * e_ref + angle.sin() * e_perp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_slider_picks_smaller_travel() {
        // Guide along X through the origin, crank pin at (1, 1, 0), rod 2:
        // t = 1 +- sqrt(3), smaller magnitude is 1 - sqrt(3)
        let p = slider_position(2.0, DVec3::new(1.0, 1.0, 0.0), DVec3::ZERO, DVec3::X).unwrap();
        assert_relative_eq!(p.x, 1.0 - 3f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(p.y, 0.0);
        assert_relative_eq!((p - DVec3::new(1.0, 1.0, 0.0)).length(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_slider_tie_takes_first_root() {
        let p = slider_position(2.0, DVec3::ZERO, DVec3::ZERO, DVec3::X).unwrap();
        assert_relative_eq!(p.x, 2.0);
    }

    #[test]
    fn test_slider_out_of_reach() {
        let result = slider_position(0.5, DVec3::new(0.0, 1.0, 0.0), DVec3::ZERO, DVec3::X);
        assert!(matches!(result, Err(ExpressionError::Unsolvable(_))));
        assert_eq!(
            slider_position(1.0, DVec3::ZERO, DVec3::ZERO, DVec3::ZERO),
            Err(ExpressionError::ZeroVector)
        );
    }

    #[test]
    fn test_crank_drive_symmetric_roots() {
        // Crank pin on the +X axis at distance 2, follower radius 1, rod sqrt(3):
        // roots at +-60 degrees, tie goes to the positive one
        let p = crank_drive_position(
            3f64.sqrt(),
            DVec3::new(2.0, 0.0, 0.0),
            1.0,
            DVec3::ZERO,
            DVec3::Z,
            1e-9,
        )
        .unwrap();
        assert_relative_eq!(p.x, 0.5, epsilon = 1e-12);
        assert_relative_eq!(p.y, 3f64.sqrt() / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_crank_drive_prefers_smaller_angle() {
        // Crank pin above the X axis: the root closer to the reference wins
        let pin = DVec3::new(2.0, 1.0, 0.0);
        let p = crank_drive_position(2.0, pin, 1.0, DVec3::ZERO, DVec3::Z, 1e-9).unwrap();
        assert_relative_eq!((p - pin).length(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(p.length(), 1.0, epsilon = 1e-12);
        let angle = p.y.atan2(p.x);
        let base = 0.5f64.atan();
        let phi = ((1.0 + 5.0 - 4.0) / (2.0 * 5f64.sqrt())).acos();
        assert_relative_eq!(angle, base - phi, epsilon = 1e-9);
    }

    #[test]
    fn test_crank_drive_out_of_domain() {
        let result = crank_drive_position(
            0.1,
            DVec3::new(3.0, 0.0, 0.0),
            1.0,
            DVec3::ZERO,
            DVec3::Z,
            1e-9,
        );
        assert!(matches!(
            result,
            Err(ExpressionError::Domain {
                function: "acos",
                ..
            })
        ));
    }

    #[test]
    fn test_wrap_angle() {
        assert_relative_eq!(wrap_angle(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-PI), PI, epsilon = 1e-12);
    }
}
