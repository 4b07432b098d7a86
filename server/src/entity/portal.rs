//! Portals: transfer targets with an optional expiry and a blink-visibility
//! schedule that speeds up as the remaining time shrinks.

use realm_shared::{InstanceKind, Vec2};

use crate::entity::{new_entity_id, EntityId};

#[derive(Debug)]
pub struct Portal {
    pub id: EntityId,
    pub pos: Vec2,
    pub radius: f32,
    /// Instance id, or the literal sentinel `"vault"` resolved per-account
    /// at entry time.
    pub target: String,
    pub kind: InstanceKind,
    pub name: String,
    pub expires_at: Option<f64>,
    pub visible: bool,
    pub removed: bool,
}

impl Portal {
    pub fn new(
        pos: Vec2,
        target: String,
        kind: InstanceKind,
        name: String,
        expires_at: Option<f64>,
    ) -> Portal {
        Portal {
            id: new_entity_id(),
            pos,
            radius: 0.5,
            target,
            kind,
            name,
            expires_at,
            visible: true,
            removed: false,
        }
    }

    /// Blink period for the given remaining seconds, if the portal should
    /// blink at all in that tier.
    fn blink_period_ms(remaining: f64) -> Option<u64> {
        if remaining >= 30.0 {
            None
        } else if remaining >= 10.0 {
            Some(500)
        } else if remaining >= 3.0 {
            Some(250)
        } else {
            Some(100)
        }
    }

    /// Advances expiry and visibility. `now` is the instance clock in
    /// seconds; visibility toggles on even/odd buckets of that clock so all
    /// viewers agree on the phase.
    pub fn update(&mut self, now: f64) {
        let expires_at = match self.expires_at {
            Some(at) => at,
            None => return,
        };
        if now >= expires_at {
            self.removed = true;
            return;
        }
        let remaining = expires_at - now;
        self.visible = match Self::blink_period_ms(remaining) {
            None => true,
            Some(period) => {
                let bucket = (now * 1000.0) as u64 / period;
                bucket % 2 == 0
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portal(expires_at: Option<f64>) -> Portal {
        Portal::new(
            Vec2::ZERO,
            "realm-main".to_string(),
            InstanceKind::Dungeon,
            "Test Rift".to_string(),
            expires_at,
        )
    }

    #[test]
    fn test_permanent_portal_never_blinks() {
        let mut p = portal(None);
        for step in 0..100 {
            p.update(step as f64 * 0.05);
            assert!(p.visible);
            assert!(!p.removed);
        }
    }

    #[test]
    fn test_steady_above_thirty_seconds() {
        let mut p = portal(Some(120.0));
        p.update(10.0);
        assert!(p.visible);
        p.update(89.9);
        assert!(p.visible);
    }

    #[test]
    fn test_blink_tiers() {
        // 2.5 s portal: at +2.0 s remaining is 0.5 s, the 100 ms tier.
        let mut p = portal(Some(2.5));
        p.update(2.0);
        // bucket = 2000 / 100 = 20, even -> visible.
        assert!(p.visible);
        p.update(2.1);
        // bucket 21, odd -> hidden.
        assert!(!p.visible);
        assert!(!p.removed);
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(Portal::blink_period_ms(45.0), None);
        assert_eq!(Portal::blink_period_ms(29.9), Some(500));
        assert_eq!(Portal::blink_period_ms(9.9), Some(250));
        assert_eq!(Portal::blink_period_ms(2.9), Some(100));
    }

    #[test]
    fn test_self_removal_at_expiry() {
        let mut p = portal(Some(2.5));
        p.update(2.49);
        assert!(!p.removed);
        p.update(2.5);
        assert!(p.removed);
    }
}
