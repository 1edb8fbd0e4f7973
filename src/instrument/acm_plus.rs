//! Falmouth ACM-Plus acoustic current meter.
//!
//! Lines look like:
//!
//! ```text
//!  -0.52,  1.31, 10:15:02, 03-05-2024, 17.42
//! ```
//!
//! i.e. `vy, vx, time, date, water temperature`. Velocities are cm/s
//! relative to the arrow on the velocity head; temperature is °C.
//! Speed and compass direction are derived once from `vx`/`vy`.

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::Utc;
use regex::Regex;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::debug;

use super::{CommandSink, Instrument};
use crate::item::Item;

const LINE_PATTERN: &str = r"^\s*(?P<vy>-?\d+\.\d+),\s+(?P<vx>-?\d+\.\d+),\s+(?P<time>\d{2}:\d{2}:\d{2}),\s+(?P<date>\d{2}-\d{2}-\d{4}),\s+(?P<water_temp>-?\d+\.\d+)";

fn line_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LINE_PATTERN).ok()).as_ref()
}

/// One current-meter reading with its derived quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentReading {
    /// Velocity along the head's x axis, cm/s.
    pub vx: Option<BigDecimal>,
    /// Velocity along the head's y axis, cm/s.
    pub vy: Option<BigDecimal>,
    /// Water temperature, °C.
    pub water_temp: Option<BigDecimal>,
    /// Current speed, cm/s.
    pub speed: Option<BigDecimal>,
    /// Compass bearing the current flows towards, degrees.
    pub direction: Option<BigDecimal>,
}

impl CurrentReading {
    /// Builds a reading, deriving speed and direction when both components exist.
    pub fn new(
        vx: Option<BigDecimal>,
        vy: Option<BigDecimal>,
        water_temp: Option<BigDecimal>,
    ) -> Self {
        let components = vx
            .as_ref()
            .and_then(ToPrimitive::to_f64)
            .zip(vy.as_ref().and_then(ToPrimitive::to_f64));

        let (speed, direction) = match components {
            Some((x, y)) => {
                let speed = x.hypot(y);
                // Compass bearing: 0° along +vy, clockwise.
                let direction = (speed > 0.0)
                    .then(|| (90.0 - y.atan2(x).to_degrees()).rem_euclid(360.0));
                (round3(speed), direction.and_then(round3))
            }
            None => (None, None),
        };

        Self {
            vx,
            vy,
            water_temp,
            speed,
            direction,
        }
    }

    /// Item stamped now, with the fields that are present.
    pub fn into_item(self) -> Item {
        Item::builder(Utc::now())
            .maybe_field("vx", self.vx)
            .maybe_field("vy", self.vy)
            .maybe_field("water_temp", self.water_temp)
            .maybe_field("speed", self.speed)
            .maybe_field("direction", self.direction)
            .build()
    }
}

fn round3(value: f64) -> Option<BigDecimal> {
    BigDecimal::from_str(&format!("{value:.3}")).ok()
}

fn decimal(raw: &str) -> Option<BigDecimal> {
    BigDecimal::from_str(raw).ok()
}

/// Parser and setup for the ACM-Plus.
#[derive(Debug, Default)]
pub struct AcmPlus;

impl AcmPlus {
    /// A new parser.
    pub fn new() -> Self {
        Self
    }

    /// Decodes one line into a reading without building an item.
    pub fn parse_reading(&self, line: &str) -> Option<CurrentReading> {
        let caps = line_regex()?.captures(line)?;
        Some(CurrentReading::new(
            decimal(&caps["vx"]),
            decimal(&caps["vy"]),
            decimal(&caps["water_temp"]),
        ))
    }
}

impl Instrument for AcmPlus {
    fn name(&self) -> &str {
        "ACMPlus"
    }

    fn parse(&self, line: &str) -> Option<Item> {
        let reading = self.parse_reading(line);
        if reading.is_none() {
            debug!(line, "Line is not an ACM-Plus measurement");
        }
        reading.map(CurrentReading::into_item)
    }

    fn configure(&self, commands: &CommandSink) {
        commands.send("MODE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn line_pattern_compiles() {
        assert!(line_regex().is_some());
    }

    #[test]
    fn parses_a_measurement_line() {
        let line = " 4.00,  3.00, 10:15:02, 03-05-2024, 17.42";
        let item = AcmPlus::new().parse(line).unwrap();

        assert_eq!(item.field("vy"), Some(&dec("4.00")));
        assert_eq!(item.field("vx"), Some(&dec("3.00")));
        assert_eq!(item.field("water_temp"), Some(&dec("17.42")));
        assert_eq!(item.field("speed"), Some(&dec("5.000")));
        assert_eq!(item.field("direction"), Some(&dec("36.870")));
    }

    #[test]
    fn rejects_garbage() {
        assert!(AcmPlus::new().parse("MODE ACK").is_none());
        assert!(AcmPlus::new().parse("").is_none());
    }

    #[test]
    fn direction_covers_all_quadrants() {
        let cases = [
            ("1.0", "1.0", "45.000"),
            ("1.0", "-1.0", "135.000"),
            ("-1.0", "-1.0", "225.000"),
            ("-1.0", "1.0", "315.000"),
        ];
        for (vx, vy, expected) in cases {
            let reading = CurrentReading::new(Some(dec(vx)), Some(dec(vy)), None);
            assert_eq!(reading.direction, Some(dec(expected)), "vx={vx} vy={vy}");
        }
    }

    #[test]
    fn derived_fields_absent_without_components() {
        let reading = CurrentReading::new(Some(dec("1.0")), None, Some(dec("12.0")));
        assert!(reading.speed.is_none());
        assert!(reading.direction.is_none());

        let item = reading.into_item();
        assert!(item.field("speed").is_none());
        assert_eq!(item.field("water_temp"), Some(&dec("12.0")));
    }

    #[test]
    fn still_water_has_no_direction() {
        let reading = CurrentReading::new(Some(dec("0.0")), Some(dec("0.0")), None);
        assert_eq!(reading.speed, Some(dec("0.000")));
        assert!(reading.direction.is_none());
    }

    #[test]
    fn configure_sends_mode() {
        let queue = crate::queue::Queue::unbounded();
        AcmPlus::new().configure(&CommandSink::new(queue.clone()));
        assert_eq!(queue.try_take(), crate::queue::Take::Item("MODE".to_string()));
    }
}
