//! Movement primitives and the key sequences that perform them.

use serde::{Deserialize, Serialize};

use crate::input::{Direction, InputTarget, KeyKind, KeyRequest};
use crate::localization::Position;
use crate::scheduler::ActionStep;
use crate::settings::{KeyBindings, NavigationSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    Walk,
    /// Double jump.
    Jump,
    UpJump,
    /// Rope lift.
    Grapple,
    Fall,
}

/// Smallest climb worth a rope lift.
pub const GRAPPLE_MIN_DY: i64 = 24;

/// Largest climb a rope lift reaches.
pub const GRAPPLE_MAX_DY: i64 = 41;

/// Walk below `jump_threshold`, jump at or above it.
pub fn horizontal_primitive(distance: i64, jump_threshold: i32) -> Primitive {
    if distance.abs() < i64::from(jump_threshold) {
        Primitive::Walk
    } else {
        Primitive::Jump
    }
}

/// Next primitive to get from `from` to `to`, or None when arrived.
///
/// Vertical primitives are only used once horizontally aligned. Climbs
/// between [`GRAPPLE_MIN_DY`] and [`GRAPPLE_MAX_DY`] use the rope lift when
/// one is bound.
pub fn next_primitive(
    from: Position,
    to: Position,
    nav: &NavigationSettings,
    keys: &KeyBindings,
) -> Option<(Primitive, Option<Direction>)> {
    let dx = from.dx(to);
    let dy = from.dy(to);
    let aligned = dx.abs() <= i64::from(nav.arrival_threshold);

    if aligned && dy.abs() <= i64::from(nav.arrival_y_threshold) {
        return None;
    }
    if aligned {
        let grapple = keys.grapple.is_some() && (GRAPPLE_MIN_DY..=GRAPPLE_MAX_DY).contains(&dy);
        let primitive = if grapple {
            Primitive::Grapple
        } else if dy > 0 {
            Primitive::UpJump
        } else {
            Primitive::Fall
        };
        return Some((primitive, None));
    }
    Some((
        horizontal_primitive(dx, nav.jump_threshold),
        Direction::towards(from.x, to.x),
    ))
}

/// A key tap whose hold time is left to the seeded key timing.
pub fn tap(key: KeyKind) -> ActionStep {
    ActionStep::Input(InputTarget::Key(KeyRequest { key, down_ms: 0 }))
}

pub fn key_down(key: KeyKind) -> ActionStep {
    ActionStep::Input(InputTarget::KeyDown { key })
}

pub fn key_up(key: KeyKind) -> ActionStep {
    ActionStep::Input(InputTarget::KeyUp { key })
}

/// Key sequence for a primitive. Horizontal primitives need a direction
/// and produce an empty payload without one.
pub fn payload(
    primitive: Primitive,
    direction: Option<Direction>,
    keys: &KeyBindings,
    nav: &NavigationSettings,
) -> Vec<ActionStep> {
    match (primitive, direction) {
        (Primitive::Walk, Some(dir)) => vec![
            key_down(dir.key()),
            ActionStep::Wait(nav.walk_hold()),
            key_up(dir.key()),
        ],
        (Primitive::Jump, Some(dir)) => vec![
            key_down(dir.key()),
            tap(keys.jump),
            ActionStep::Wait(nav.double_jump_delay()),
            tap(keys.jump),
            ActionStep::Wait(nav.jump_settle()),
            key_up(dir.key()),
        ],
        (Primitive::Walk | Primitive::Jump, None) => Vec::new(),
        (Primitive::UpJump, _) => match keys.up_jump {
            Some(skill) => vec![tap(skill), ActionStep::Wait(nav.jump_settle())],
            None => vec![
                key_down(KeyKind::Up),
                tap(keys.jump),
                ActionStep::Wait(nav.jump_settle()),
                key_up(KeyKind::Up),
            ],
        },
        (Primitive::Grapple, _) => match keys.grapple {
            Some(skill) => vec![
                tap(skill),
                ActionStep::Wait(nav.grapple_hold()),
                tap(skill),
            ],
            None => Vec::new(),
        },
        (Primitive::Fall, _) => vec![
            key_down(KeyKind::Down),
            tap(keys.jump),
            ActionStep::Wait(nav.jump_settle()),
            key_up(KeyKind::Down),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_below_threshold_jump_at_and_above() {
        assert_eq!(horizontal_primitive(24, 25), Primitive::Walk);
        assert_eq!(horizontal_primitive(-24, 25), Primitive::Walk);
        assert_eq!(horizontal_primitive(25, 25), Primitive::Jump);
        assert_eq!(horizontal_primitive(26, 25), Primitive::Jump);
        assert_eq!(horizontal_primitive(-26, 25), Primitive::Jump);
    }

    #[test]
    fn test_next_primitive_direction() {
        let nav = NavigationSettings::default();
        let keys = KeyBindings::default();
        let from = Position::new(100, 40);

        assert_eq!(
            next_primitive(from, Position::new(124, 40), &nav, &keys),
            Some((Primitive::Walk, Some(Direction::Right)))
        );
        assert_eq!(
            next_primitive(from, Position::new(74, 40), &nav, &keys),
            Some((Primitive::Jump, Some(Direction::Left)))
        );
    }

    #[test]
    fn test_next_primitive_across_the_whole_range() {
        let nav = NavigationSettings::default();
        let keys = KeyBindings::default();

        let left_edge = Position::new(i32::MIN, 0);
        let right_edge = Position::new(i32::MAX, 0);

        assert_eq!(
            next_primitive(left_edge, right_edge, &nav, &keys),
            Some((Primitive::Jump, Some(Direction::Right)))
        );
        assert_eq!(
            next_primitive(right_edge, left_edge, &nav, &keys),
            Some((Primitive::Jump, Some(Direction::Left)))
        );
        assert_eq!(
            next_primitive(Position::new(0, i32::MIN), Position::new(0, i32::MAX), &nav, &keys),
            Some((Primitive::UpJump, None))
        );
    }

    #[test]
    fn test_next_primitive_vertical_when_aligned() {
        let nav = NavigationSettings::default();
        let keys = KeyBindings::default();
        let from = Position::new(100, 40);

        assert_eq!(
            next_primitive(from, Position::new(102, 60), &nav, &keys),
            Some((Primitive::UpJump, None))
        );
        assert_eq!(
            next_primitive(from, Position::new(99, 10), &nav, &keys),
            Some((Primitive::Fall, None))
        );
        assert_eq!(next_primitive(from, Position::new(103, 42), &nav, &keys), None);
    }

    #[test]
    fn test_grapple_for_mid_sized_climbs_when_bound() {
        let nav = NavigationSettings::default();
        let keys = KeyBindings {
            grapple: Some(KeyKind::R),
            ..Default::default()
        };
        let from = Position::new(100, 40);

        assert_eq!(
            next_primitive(from, Position::new(100, 40 + 23), &nav, &keys),
            Some((Primitive::UpJump, None))
        );
        assert_eq!(
            next_primitive(from, Position::new(100, 40 + 24), &nav, &keys),
            Some((Primitive::Grapple, None))
        );
        assert_eq!(
            next_primitive(from, Position::new(100, 40 + 41), &nav, &keys),
            Some((Primitive::Grapple, None))
        );
        assert_eq!(
            next_primitive(from, Position::new(100, 40 + 42), &nav, &keys),
            Some((Primitive::UpJump, None))
        );
        // Without a binding the same climb is an up-jump.
        assert_eq!(
            next_primitive(from, Position::new(100, 70), &nav, &KeyBindings::default()),
            Some((Primitive::UpJump, None))
        );
    }

    #[test]
    fn test_grapple_payload_starts_and_stops_the_lift() {
        let nav = NavigationSettings::default();
        let keys = KeyBindings {
            grapple: Some(KeyKind::R),
            ..Default::default()
        };
        assert_eq!(
            payload(Primitive::Grapple, None, &keys, &nav),
            vec![tap(KeyKind::R), ActionStep::Wait(nav.grapple_hold()), tap(KeyKind::R)]
        );
    }

    #[test]
    fn test_walk_payload_releases_direction() {
        let nav = NavigationSettings::default();
        let steps = payload(
            Primitive::Walk,
            Some(Direction::Left),
            &KeyBindings::default(),
            &nav,
        );
        assert_eq!(
            steps,
            vec![
                key_down(KeyKind::Left),
                ActionStep::Wait(nav.walk_hold()),
                key_up(KeyKind::Left),
            ]
        );
    }

    #[test]
    fn test_jump_payload_double_taps_jump() {
        let keys = KeyBindings {
            jump: KeyKind::Alt,
            ..Default::default()
        };
        let steps = payload(
            Primitive::Jump,
            Some(Direction::Right),
            &keys,
            &NavigationSettings::default(),
        );
        let taps = steps.iter().filter(|s| **s == tap(KeyKind::Alt)).count();
        assert_eq!(taps, 2);
        assert_eq!(steps.first(), Some(&key_down(KeyKind::Right)));
        assert_eq!(steps.last(), Some(&key_up(KeyKind::Right)));
    }

    #[test]
    fn test_up_jump_prefers_skill_binding() {
        let keys = KeyBindings {
            up_jump: Some(KeyKind::C),
            ..Default::default()
        };
        let steps = payload(Primitive::UpJump, None, &keys, &NavigationSettings::default());
        assert_eq!(steps[0], tap(KeyKind::C));
    }

    #[test]
    fn test_horizontal_without_direction_is_empty() {
        let steps = payload(
            Primitive::Walk,
            None,
            &KeyBindings::default(),
            &NavigationSettings::default(),
        );
        assert!(steps.is_empty());
    }
}
