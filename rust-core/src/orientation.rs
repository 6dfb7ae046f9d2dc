//! Head orientation helpers.
//!
//! The tracker carries orientation as small-angle roll/pitch/yaw so the
//! filter stays linear. Consumers usually want a quaternion instead (the
//! capture harness labels poses as `x, y, z, i, j, k, w`), so this module
//! converts between the two and keeps angles wrapped.
//!
//! Convention: intrinsic Z-Y-X (yaw, then pitch, then roll), radians.

use std::f64::consts::{PI, TAU};

/// Head orientation as a unit quaternion, scalar part `w`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    /// Vector part, written `(i, j, k)` by the capture harness
    pub xyz: [f64; 3],
}

impl Quaternion {
    /// Build from roll, pitch, yaw in radians.
    pub fn from_euler(roll: f64, pitch: f64, yaw: f64) -> Self {
        let (sr, cr) = (roll * 0.5).sin_cos();
        let (sp, cp) = (pitch * 0.5).sin_cos();
        let (sy, cy) = (yaw * 0.5).sin_cos();

        Self {
            w: cr * cp * cy + sr * sp * sy,
            xyz: [
                sr * cp * cy - cr * sp * sy,
                cr * sp * cy + sr * cp * sy,
                cr * cp * sy - sr * sp * cy,
            ],
        }
    }

    /// Canonical roll, pitch, yaw in radians. Pitch is clamped to ±π/2 at
    /// gimbal lock.
    pub fn to_euler(&self) -> [f64; 3] {
        let w = self.w;
        let [x, y, z] = self.xyz;

        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

        [roll, pitch, yaw]
    }

    /// Unit gaze direction, with the head looking down +x at rest.
    ///
    /// First column of the rotation matrix.
    pub fn gaze_direction(&self) -> [f64; 3] {
        let w = self.w;
        let [x, y, z] = self.xyz;
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y + w * z),
            2.0 * (x * z - w * y),
        ]
    }
}

/// Wrap an angle into (-π, π].
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}
