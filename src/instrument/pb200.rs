//! Airmar PB200 weather station.
//!
//! The station talks NMEA-0183; only the meteorological composite sentence
//! is a measurement:
//!
//! ```text
//! $WIMDA,30.3273,I,1.027,B,26.8,C,20.1,C,12.3,21.0,2.3,C,2.0,T,128.7,M,134.6,N,0.3,M*28
//! ```
//!
//! Fields come in value/unit pairs. Barometric pressure is reported in bars
//! and stored in millibars. Empty values are left out of the item.

use bigdecimal::BigDecimal;
use chrono::Utc;
use std::str::FromStr;
use tracing::debug;

use super::Instrument;
use crate::item::Item;

/// Item field and its position among the comma-separated MDA values.
const MDA_FIELDS: [(&str, usize); 10] = [
    ("press_inch", 0),
    ("air_temp", 4),
    ("water_temp", 6),
    ("rel_humidity", 8),
    ("abs_humidity", 9),
    ("dew_point", 10),
    ("wind_dir_true", 12),
    ("wind_dir_magnetic", 14),
    ("wind_knots", 16),
    ("wind_meters", 18),
];

const PRESS_BAR: usize = 2;

/// XOR of every byte between `$` and `*`.
fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Splits `$<body>*<hh>` and verifies the checksum when one is present.
fn sentence_body(line: &str) -> Option<&str> {
    let start = line.find('$')?;
    let sentence = line[start + 1..].trim_end();
    match sentence.split_once('*') {
        Some((body, declared)) => {
            let declared = u8::from_str_radix(declared, 16).ok()?;
            if declared != checksum(body) {
                debug!(line, declared, computed = checksum(body), "NMEA checksum mismatch");
                return None;
            }
            Some(body)
        }
        None => Some(sentence),
    }
}

fn decimal(raw: &str) -> Option<BigDecimal> {
    match raw.trim() {
        "" => None,
        value => BigDecimal::from_str(value).ok(),
    }
}

/// Parser for the PB200.
#[derive(Debug, Default)]
pub struct Pb200;

impl Pb200 {
    /// A new parser.
    pub fn new() -> Self {
        Self
    }

    /// Decodes one `xxMDA` sentence into named fields.
    ///
    /// Any talker id is accepted. Other sentence types and sentences with a
    /// wrong checksum yield `None`.
    pub fn parse_mda(&self, line: &str) -> Option<Vec<(&'static str, BigDecimal)>> {
        let body = sentence_body(line)?;
        let mut parts = body.split(',');
        let address = parts.next()?;
        if address.len() != 5 || !address.ends_with("MDA") {
            return None;
        }
        let values: Vec<&str> = parts.collect();
        let value = |index: usize| values.get(index).and_then(|raw| decimal(raw));

        let mut fields: Vec<(&'static str, BigDecimal)> = MDA_FIELDS
            .iter()
            .filter_map(|&(name, index)| value(index).map(|v| (name, v)))
            .collect();
        if let Some(bar) = value(PRESS_BAR) {
            fields.push(("press_mbar", bar * BigDecimal::from(1000)));
        }
        Some(fields)
    }
}

impl Instrument for Pb200 {
    fn name(&self) -> &str {
        "PB200"
    }

    fn parse(&self, line: &str) -> Option<Item> {
        let Some(fields) = self.parse_mda(line) else {
            debug!(line, "Line is not a PB200 MDA sentence");
            return None;
        };
        let item = fields
            .into_iter()
            .fold(Item::builder(Utc::now()), |builder, (name, value)| builder.field(name, value))
            .build();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn sentence(body: &str) -> String {
        format!("${body}*{:02X}\r", checksum(body))
    }

    const FULL: &str =
        "WIMDA,30.3273,I,1.027,B,26.8,C,20.1,C,12.3,21.0,2.3,C,2.0,T,128.7,M,134.6,N,0.3,M";

    #[test]
    fn parses_a_complete_sentence() {
        let item = Pb200::new().parse(&sentence(FULL)).unwrap();

        let expected = [
            ("press_inch", "30.3273"),
            ("press_mbar", "1027.0"),
            ("air_temp", "26.8"),
            ("water_temp", "20.1"),
            ("rel_humidity", "12.3"),
            ("abs_humidity", "21.0"),
            ("dew_point", "2.3"),
            ("wind_dir_true", "2.0"),
            ("wind_dir_magnetic", "128.7"),
            ("wind_knots", "134.6"),
            ("wind_meters", "0.3"),
        ];
        for (name, value) in expected {
            assert_eq!(item.field(name), Some(&dec(value)), "{name}");
        }
        assert_eq!(item.fields().len(), expected.len());
    }

    #[test]
    fn accepts_the_station_checksum() {
        let line = format!("${FULL}*28\r\n");
        assert!(Pb200::new().parse(&line).is_some());
    }

    #[test]
    fn empty_values_are_left_out() {
        let body = "WIMDA,30.3273,I,1.027,B,26.8,C,,C,,21.0,2.3,C,2.0,T,128.7,M,134.6,N,0.3,M";
        let item = Pb200::new().parse(&sentence(body)).unwrap();
        assert!(item.field("water_temp").is_none());
        assert!(item.field("rel_humidity").is_none());
        assert_eq!(item.field("air_temp"), Some(&dec("26.8")));
    }

    #[test]
    fn wrong_checksum_is_rejected() {
        let line = format!("${FULL}*{:02X}", checksum(FULL) ^ 0x01);
        assert!(Pb200::new().parse(&line).is_none());
    }

    #[test]
    fn sentence_without_checksum_is_accepted() {
        let item = Pb200::new().parse(&format!("${FULL}")).unwrap();
        assert_eq!(item.field("wind_knots"), Some(&dec("134.6")));
    }

    #[test]
    fn other_sentences_are_not_measurements() {
        let gga = "GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,";
        assert!(Pb200::new().parse(&sentence(gga)).is_none());
        assert!(Pb200::new().parse("garbage").is_none());
        assert!(Pb200::new().parse("").is_none());
    }
}
