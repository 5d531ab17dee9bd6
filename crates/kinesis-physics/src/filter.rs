//! Collision filter words and the pair-filter protocol.
//!
//! Each shape carries two four-word filters. The simulation filter decides
//! whether two shapes interact:
//!
//! - `word0` holds engine-level flags; bit 0 is the CCD request.
//! - `word1` is the type mask (what the shape is).
//! - `word2` is the collide-with mask (what the shape wants to touch).
//!
//! The query filter only uses `word3`, which marks drivable and
//! non-drivable surfaces for suspension raycasts.

use bitflags::bitflags;

/// `word0` bit requesting continuous collision detection.
pub const CCD_FLAG: u32 = 1 << 0;

/// Query `word3` of surfaces wheels may stand on.
pub const DRIVABLE_SURFACE: u32 = 0xFFFF_0000;
/// Query `word3` of vehicle parts and other surfaces wheels ignore.
pub const UNDRIVABLE_SURFACE: u32 = 0x0000_FFFF;

/// Type bit of drivable ground shapes.
pub const GROUND_TYPE: u32 = 1 << 28;
/// Type bit of vehicle chassis shapes.
pub const CHASSIS_TYPE: u32 = 1 << 29;
/// Type bit of vehicle wheel shapes.
pub const WHEEL_TYPE: u32 = 1 << 30;

/// Ground touches everything but other ground and wheels.
pub const GROUND_COLLIDE_WITH: u32 = !(GROUND_TYPE | WHEEL_TYPE);
/// Chassis touches everything but wheels.
pub const CHASSIS_COLLIDE_WITH: u32 = !WHEEL_TYPE;
/// Wheels touch everything but ground and chassis; the suspension carries them.
pub const WHEEL_COLLIDE_WITH: u32 = !(GROUND_TYPE | CHASSIS_TYPE);

/// Four filter words attached to a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FilterData {
    pub word0: u32,
    pub word1: u32,
    pub word2: u32,
    pub word3: u32,
}

impl FilterData {
    /// Simulation filter with the given masks and no engine flags.
    pub const fn simulation(type_mask: u32, collide_with_mask: u32) -> Self {
        Self {
            word0: 0,
            word1: type_mask,
            word2: collide_with_mask,
            word3: 0,
        }
    }

    /// Query filter carrying only a surface marker.
    pub const fn query(word3: u32) -> Self {
        Self {
            word0: 0,
            word1: 0,
            word2: 0,
            word3,
        }
    }

    /// Type mask.
    pub fn type_mask(&self) -> u32 {
        self.word1
    }

    /// Collide-with mask.
    pub fn collide_with_mask(&self) -> u32 {
        self.word2
    }

    /// Rewrites both masks. `word0` is left untouched.
    pub fn with_masks(self, type_mask: u32, collide_with_mask: u32) -> Self {
        Self {
            word1: type_mask,
            word2: collide_with_mask,
            ..self
        }
    }

    /// Sets or clears the CCD bit without touching any other bit.
    pub fn with_ccd(self, enabled: bool) -> Self {
        let word0 = if enabled {
            self.word0 | CCD_FLAG
        } else {
            self.word0 & !CCD_FLAG
        };
        Self { word0, ..self }
    }

    /// Whether the CCD bit is set.
    pub fn ccd_enabled(&self) -> bool {
        self.word0 & CCD_FLAG != 0
    }

    /// Whether a suspension ray may stop on this surface.
    pub fn is_drivable(&self) -> bool {
        self.word3 & DRIVABLE_SURFACE != 0
    }

    /// Packs the words into a single integer, `word0` in the low bits.
    pub fn pack(&self) -> u128 {
        u128::from(self.word0)
            | u128::from(self.word1) << 32
            | u128::from(self.word2) << 64
            | u128::from(self.word3) << 96
    }

    /// Inverse of [`FilterData::pack`].
    pub fn unpack(bits: u128) -> Self {
        Self {
            word0: bits as u32,
            word1: (bits >> 32) as u32,
            word2: (bits >> 64) as u32,
            word3: (bits >> 96) as u32,
        }
    }
}

bitflags! {
    /// Processing requested for a shape pair that passed the filter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PairFlags: u32 {
        /// Solve the contact.
        const CONTACT_DEFAULT = 1 << 0;
        /// Report the first frame of contact.
        const NOTIFY_TOUCH_FOUND = 1 << 1;
        /// Report every following frame of contact.
        const NOTIFY_TOUCH_PERSISTS = 1 << 2;
        /// Include contact points in reports.
        const NOTIFY_CONTACT_POINTS = 1 << 3;
        /// Sweep the pair continuously.
        const DETECT_CCD_CONTACT = 1 << 4;
    }
}

/// What a collider is to the vehicle layer. Decides its masks and its
/// query surface marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SurfaceRole {
    /// Masks from the component, ignored by suspension rays.
    #[default]
    Plain,
    /// Drivable ground.
    Ground,
    /// Vehicle chassis.
    Chassis,
    /// Vehicle wheel.
    Wheel,
}

impl SurfaceRole {
    /// Simulation masks for a collider whose component asks for
    /// `(type_mask, collide_with_mask)`.
    pub fn masks(self, type_mask: u32, collide_with_mask: u32) -> (u32, u32) {
        match self {
            SurfaceRole::Plain => (type_mask, collide_with_mask),
            SurfaceRole::Ground => (GROUND_TYPE, GROUND_COLLIDE_WITH),
            SurfaceRole::Chassis => (CHASSIS_TYPE, CHASSIS_COLLIDE_WITH),
            SurfaceRole::Wheel => (WHEEL_TYPE, WHEEL_COLLIDE_WITH),
        }
    }

    pub fn query_filter(self) -> FilterData {
        match self {
            SurfaceRole::Plain => FilterData::default(),
            SurfaceRole::Ground => FilterData::query(DRIVABLE_SURFACE),
            SurfaceRole::Chassis | SurfaceRole::Wheel => FilterData::query(UNDRIVABLE_SURFACE),
        }
    }
}

/// Decides how a shape pair is processed. `None` suppresses the pair.
///
/// A pair interacts when either shape's type intersects the other's
/// collide-with mask. CCD is requested if either shape asks for it.
pub fn pair_flags(a: &FilterData, b: &FilterData) -> Option<PairFlags> {
    if a.word1 & b.word2 == 0 && b.word1 & a.word2 == 0 {
        return None;
    }

    let mut flags = PairFlags::CONTACT_DEFAULT
        | PairFlags::NOTIFY_TOUCH_FOUND
        | PairFlags::NOTIFY_TOUCH_PERSISTS
        | PairFlags::NOTIFY_CONTACT_POINTS;
    if a.ccd_enabled() || b.ccd_enabled() {
        flags |= PairFlags::DETECT_CCD_CONTACT;
    }
    Some(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASKS: [u32; 6] = [0, 0x1, 0x2, 0x3, 0xFFFF_FFFF, CHASSIS_TYPE | 0x4];

    #[test]
    fn test_suppression_is_symmetric() {
        for ta in MASKS {
            for ca in MASKS {
                for tb in MASKS {
                    for cb in MASKS {
                        let a = FilterData::simulation(ta, ca);
                        let b = FilterData::simulation(tb, cb);
                        assert_eq!(
                            pair_flags(&a, &b),
                            pair_flags(&b, &a),
                            "asymmetric for a=({ta:#x},{ca:#x}) b=({tb:#x},{cb:#x})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_one_sided_interest_is_enough() {
        let a = FilterData::simulation(0x1, 0x2);
        let b = FilterData::simulation(0x2, 0x1);
        assert!(pair_flags(&a, &b).is_some());

        let watcher = FilterData::simulation(0x4, 0x8);
        let target = FilterData::simulation(0x8, 0x0);
        assert!(pair_flags(&watcher, &target).is_some());
    }

    #[test]
    fn test_zero_collide_masks_always_suppressed() {
        let a = FilterData::simulation(0xFFFF_FFFF, 0);
        let b = FilterData::simulation(0xFFFF_FFFF, 0);
        assert!(pair_flags(&a, &b).is_none());
    }

    #[test]
    fn test_ccd_requested_by_either_side() {
        let plain = FilterData::simulation(0x1, 0x1);
        let fast = plain.with_ccd(true);
        let flags = pair_flags(&plain, &fast).unwrap();
        assert!(flags.contains(PairFlags::DETECT_CCD_CONTACT));
        assert!(flags.contains(PairFlags::NOTIFY_CONTACT_POINTS));
        assert!(!pair_flags(&plain, &plain).unwrap().contains(PairFlags::DETECT_CCD_CONTACT));
    }

    #[test]
    fn test_ccd_bit_isolated_from_masks() {
        let base = FilterData {
            word0: 0xF0,
            word1: 0x1234,
            word2: 0x5678,
            word3: DRIVABLE_SURFACE,
        };
        let on = base.with_ccd(true);
        assert_eq!((on.word1, on.word2, on.word3), (0x1234, 0x5678, DRIVABLE_SURFACE));
        assert_eq!(on.word0, 0xF1);
        assert_eq!(on.with_ccd(false), base);

        let remasked = on.with_masks(0x1, 0x2);
        assert!(remasked.ccd_enabled(), "mask rewrite must keep the CCD bit");
        assert_eq!(remasked.word0, 0xF1);
    }

    #[test]
    fn test_vehicle_masks() {
        let ground = FilterData::simulation(GROUND_TYPE, GROUND_COLLIDE_WITH);
        let chassis = FilterData::simulation(CHASSIS_TYPE, CHASSIS_COLLIDE_WITH);
        let wheel = FilterData::simulation(WHEEL_TYPE, WHEEL_COLLIDE_WITH);
        let crate_box = FilterData::simulation(0x1, 0xFFFF_FFFF);

        assert!(pair_flags(&wheel, &ground).is_none());
        assert!(pair_flags(&wheel, &chassis).is_none());
        assert!(pair_flags(&ground, &ground).is_none());
        assert!(pair_flags(&chassis, &ground).is_some());
        assert!(pair_flags(&wheel, &crate_box).is_some());
    }

    #[test]
    fn test_surface_roles() {
        assert_eq!(SurfaceRole::Plain.masks(0x3, 0x5), (0x3, 0x5));
        assert_eq!(SurfaceRole::Wheel.masks(0x3, 0x5), (WHEEL_TYPE, WHEEL_COLLIDE_WITH));
        assert!(SurfaceRole::Ground.query_filter().is_drivable());
        assert!(!SurfaceRole::Chassis.query_filter().is_drivable());
        assert_eq!(SurfaceRole::Plain.query_filter().word3, 0);
    }

    #[test]
    fn test_pack_preserves_words() {
        let data = FilterData {
            word0: 1,
            word1: 0xDEAD_BEEF,
            word2: 7,
            word3: UNDRIVABLE_SURFACE,
        };
        assert_eq!(FilterData::unpack(data.pack()), data);
        assert!(!data.is_drivable());
        assert!(FilterData::query(DRIVABLE_SURFACE).is_drivable());
    }
}
