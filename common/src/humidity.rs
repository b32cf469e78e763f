pub const MIN_HUMIDITY: u8 = 30;
pub const MAX_HUMIDITY: u8 = 90;
pub const HUMIDITY_STEP: u8 = 5;
pub const DEFAULT_TARGET: u8 = 50;

// Device cycle is off → 30 → 35 → … → 90 → off; `None` is the off slot.
pub type Position = Option<u8>;

pub fn snap_target(value: f64) -> Option<u8> {
    if !value.is_finite() {
        return None;
    }

    let step = f64::from(HUMIDITY_STEP);
    let snapped = (value / step).floor() * step;
    let clamped = snapped.clamp(f64::from(MIN_HUMIDITY), f64::from(MAX_HUMIDITY));
    Some(clamped as u8)
}

pub fn next_position(current: Position) -> Position {
    match current {
        None => Some(MIN_HUMIDITY),
        Some(value) if value < MAX_HUMIDITY => Some(value + HUMIDITY_STEP),
        Some(_) => None,
    }
}

pub fn steps_between(from: Position, to: Position) -> usize {
    let mut position = from;
    let mut steps = 0;
    while position != to {
        position = next_position(position);
        steps += 1;
        if steps > cycle_len() {
            break;
        }
    }
    steps
}

fn cycle_len() -> usize {
    usize::from((MAX_HUMIDITY - MIN_HUMIDITY) / HUMIDITY_STEP) + 2
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn snaps_down_and_clamps() {
        assert_eq!(snap_target(47.0), Some(45));
        assert_eq!(snap_target(49.9), Some(45));
        assert_eq!(snap_target(50.0), Some(50));
        assert_eq!(snap_target(-10.0), Some(30));
        assert_eq!(snap_target(123.0), Some(90));
        assert_eq!(snap_target(f64::NAN), None);
        assert_eq!(snap_target(f64::INFINITY), None);
    }

    #[test]
    fn cycle_wraps_through_disengaged() {
        assert_eq!(next_position(None), Some(30));
        assert_eq!(next_position(Some(85)), Some(90));
        assert_eq!(next_position(Some(90)), None);
    }

    #[test]
    fn counts_steps_across_the_wrap() {
        assert_eq!(steps_between(None, Some(40)), 3);
        assert_eq!(steps_between(Some(90), Some(35)), 3);
        assert_eq!(steps_between(Some(50), Some(50)), 0);
        assert_eq!(steps_between(Some(35), Some(30)), 13);
    }
}
