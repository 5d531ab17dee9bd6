//! Distribution of a vehicle's mass over its wheels.

use glam::{Mat3, Vec2, Vec3};

use crate::error::PhysicsError;

const DEGENERATE: f32 = 1e-6;

/// Mass carried by each wheel so that the wheels together hold `total_mass`
/// with the center of mass at the origin.
///
/// `offsets` are wheel positions relative to the center of mass and
/// `gravity_axis` is the index (0, 1 or 2) of the vertical axis. Among all
/// distributions balancing the vehicle, the one closest to an even split is
/// chosen. Wheels on one line are balanced along that line only; wheels at
/// a single point share the mass evenly.
pub fn compute_sprung_masses(
    offsets: &[Vec3],
    total_mass: f32,
    gravity_axis: usize,
) -> Result<Vec<f32>, PhysicsError> {
    let n = offsets.len();
    let unsolvable = PhysicsError::SprungMassUnsolvable { wheels: n };
    match n {
        0 => return Err(unsolvable),
        1 => return Ok(vec![total_mass]),
        _ => {}
    }

    let (a, b) = match gravity_axis {
        0 => (1, 2),
        1 => (2, 0),
        _ => (0, 1),
    };
    let points: Vec<Vec2> = offsets.iter().map(|o| Vec2::new(o[a], o[b])).collect();

    let mean = points.iter().copied().sum::<Vec2>() / n as f32;
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for d in points.iter().map(|&p| p - mean) {
        sxx += d.x * d.x;
        sxy += d.x * d.y;
        syy += d.y * d.y;
    }
    let spread = sxx + syy;

    let masses = if spread <= DEGENERATE {
        vec![total_mass / n as f32; n]
    } else if sxx * syy - sxy * sxy > DEGENERATE * spread * spread {
        balance_plane(&points, total_mass)
    } else {
        let angle = 0.5 * (2.0 * sxy).atan2(sxx - syy);
        let axis = Vec2::from_angle(angle);
        let positions: Vec<f32> = points.iter().map(|p| p.dot(axis)).collect();
        balance_line(&positions, total_mass)
    };

    if masses.iter().any(|&m| !m.is_finite() || m < -1e-4 * total_mass.abs()) {
        return Err(unsolvable);
    }
    Ok(masses.into_iter().map(|m| m.max(0.0)).collect())
}

/// Minimum-norm solution of `Σm = M, Σm·x = 0, Σm·y = 0`.
fn balance_plane(points: &[Vec2], total_mass: f32) -> Vec<f32> {
    let n = points.len() as f32;
    let (mut sx, mut sy, mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for p in points {
        sx += p.x;
        sy += p.y;
        sxx += p.x * p.x;
        sxy += p.x * p.y;
        syy += p.y * p.y;
    }
    let normal = Mat3::from_cols(
        Vec3::new(n, sx, sy),
        Vec3::new(sx, sxx, sxy),
        Vec3::new(sy, sxy, syy),
    );
    let l = normal.inverse() * Vec3::new(total_mass, 0.0, 0.0);
    points.iter().map(|p| l.x + l.y * p.x + l.z * p.y).collect()
}

/// Minimum-norm solution of `Σm = M, Σm·s = 0`.
fn balance_line(positions: &[f32], total_mass: f32) -> Vec<f32> {
    let n = positions.len() as f32;
    let s: f32 = positions.iter().sum();
    let ss: f32 = positions.iter().map(|p| p * p).sum();
    let det = n * ss - s * s;
    let l0 = total_mass * ss / det;
    let l1 = -total_mass * s / det;
    positions.iter().map(|p| l0 + l1 * p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_symmetric_car_splits_evenly() {
        let offsets = [
            Vec3::new(1.5, 0.8, -0.3),
            Vec3::new(1.5, -0.8, -0.3),
            Vec3::new(-1.5, 0.8, -0.3),
            Vec3::new(-1.5, -0.8, -0.3),
        ];
        let masses = compute_sprung_masses(&offsets, 1200.0, 2).unwrap();
        assert!(masses.iter().all(|&m| close(m, 300.0)), "{masses:?}");
    }

    #[test]
    fn test_forward_center_of_mass_loads_front() {
        // Center of mass 0.5 ahead of the middle of the axles.
        let offsets = [
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(-2.0, 1.0, 0.0),
            Vec3::new(-2.0, -1.0, 0.0),
        ];
        let masses = compute_sprung_masses(&offsets, 900.0, 2).unwrap();
        let total: f32 = masses.iter().sum();
        assert!(close(total, 900.0), "total {total}");
        assert!(masses[0] > masses[2], "front wheels carry more: {masses:?}");
        let moment: f32 = masses.iter().zip(&offsets).map(|(m, o)| m * o.x).sum();
        assert!(moment.abs() < 1e-2, "unbalanced moment {moment}");
        assert!(close(masses[0], 300.0) && close(masses[2], 150.0), "{masses:?}");
    }

    #[test]
    fn test_colinear_wheels_balance_along_line() {
        let offsets = [Vec3::new(1.0, 0.0, 0.0), Vec3::new(-3.0, 0.0, 0.0)];
        let masses = compute_sprung_masses(&offsets, 80.0, 2).unwrap();
        assert!(close(masses[0], 60.0) && close(masses[1], 20.0), "{masses:?}");
    }

    #[test]
    fn test_coincident_and_single_wheels() {
        let offsets = [Vec3::new(0.0, 0.0, -1.0); 3];
        let masses = compute_sprung_masses(&offsets, 30.0, 2).unwrap();
        assert!(masses.iter().all(|&m| close(m, 10.0)), "{masses:?}");

        assert_eq!(compute_sprung_masses(&[Vec3::X], 42.0, 2).unwrap(), vec![42.0]);
        assert!(compute_sprung_masses(&[], 42.0, 2).is_err());
    }

    #[test]
    fn test_center_of_mass_outside_support_fails() {
        let offsets = [Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0)];
        assert_eq!(
            compute_sprung_masses(&offsets, 10.0, 2),
            Err(PhysicsError::SprungMassUnsolvable { wheels: 2 })
        );
    }

    #[test]
    fn test_gravity_axis_selects_plane() {
        // Y-up layout of the symmetric car.
        let offsets = [
            Vec3::new(1.5, -0.3, 0.8),
            Vec3::new(1.5, -0.3, -0.8),
            Vec3::new(-1.5, -0.3, 0.8),
            Vec3::new(-1.5, -0.3, -0.8),
        ];
        let masses = compute_sprung_masses(&offsets, 400.0, 1).unwrap();
        assert!(masses.iter().all(|&m| close(m, 100.0)), "{masses:?}");
    }
}
