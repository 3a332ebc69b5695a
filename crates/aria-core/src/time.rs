//! Wall-clock time for scheduling
//!
//! The engine measures time in seconds as `f64`, on the same epoch as the
//! `current_time` argument of the driver callback. OSC bundle timetags are
//! NTP fixed-point values; they are converted to seconds at the packet
//! boundary, with the special value `1` (seconds = 0, fractional = 1)
//! denoting "execute immediately".

/// Wall-clock time in seconds
pub type Time = f64;

/// Convert an OSC NTP timetag to seconds
#[inline]
pub fn timetag_to_seconds(seconds: u32, fractional: u32) -> Time {
    seconds as f64 + fractional as f64 / (1u64 << 32) as f64
}

/// True for the OSC "immediate" sentinel timetag
#[inline]
pub fn timetag_is_immediate(seconds: u32, fractional: u32) -> bool {
    seconds == 0 && fractional == 1
}

/// Convert seconds to an OSC NTP timetag
#[inline]
pub fn seconds_to_timetag(time: Time) -> (u32, u32) {
    let seconds = time.floor();
    let fractional = (time - seconds) * (1u64 << 32) as f64;
    (seconds as u32, fractional as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_sentinel() {
        assert!(timetag_is_immediate(0, 1));
        assert!(!timetag_is_immediate(0, 2));
        assert!(!timetag_is_immediate(1, 1));
    }

    #[test]
    fn test_timetag_roundtrip() {
        let (secs, frac) = seconds_to_timetag(1.5);
        assert_eq!(secs, 1);
        let back = timetag_to_seconds(secs, frac);
        assert!((back - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_fractional_seconds() {
        let t = timetag_to_seconds(0, u32::MAX);
        assert!(t < 1.0);
        assert!(t > 0.999_999);
    }
}
