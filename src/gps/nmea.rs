//! NMEA 0183 decoding for the two sentences the receiver state is built from.
//!
//! Only GGA (fix data) and RMC (recommended minimum) are decoded; any other
//! sentence type is reported as `Unsupported` and dropped by the reader.
//! Talker IDs are not checked, so `GP`, `GN`, `GL` etc. are all accepted.

use chrono::NaiveTime;
use thiserror::Error;

/// Knots to kilometres per hour.
pub const KNOTS_TO_KPH: f64 = 1.852;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingStart,
    #[error("checksum mismatch: expected {expected:02X}, computed {computed:02X}")]
    Checksum { expected: u8, computed: u8 },
    #[error("malformed checksum field '{0}'")]
    MalformedChecksum(String),
    #[error("unsupported sentence type '{0}'")]
    Unsupported(String),
    #[error("{kind} sentence has {found} fields, need {needed}")]
    TooFewFields {
        kind: &'static str,
        found: usize,
        needed: usize,
    },
    #[error("invalid {field} value '{value}'")]
    InvalidField { field: &'static str, value: String },
}

/// GGA: time, position, altitude, satellites in use and fix quality.
#[derive(Debug, Clone, PartialEq)]
pub struct FixData {
    pub time: NaiveTime,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub satellites: i32,
    /// 0 = invalid, 1 = GPS, 2 = DGPS, ...
    pub fix_quality: u8,
}

/// RMC: time, position, speed over ground, course and validity flag.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendedMinimum {
    pub time: NaiveTime,
    pub validity: char,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_knots: f64,
    pub course: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Fix(FixData),
    Recommended(RecommendedMinimum),
}

/// Parse a single sentence line (trailing CR/LF allowed).
pub fn parse(line: &str) -> Result<Sentence, NmeaError> {
    let line = line.trim();
    let inner = line.strip_prefix('$').ok_or(NmeaError::MissingStart)?;

    let body = match inner.split_once('*') {
        Some((body, checksum)) => {
            verify_checksum(body, checksum)?;
            body
        }
        None => inner,
    };

    let fields: Vec<&str> = body.split(',').collect();
    let kind = fields[0];
    // Talker is the first two characters, sentence type the rest.
    match kind.get(2..) {
        Some("GGA") => parse_gga(&fields).map(Sentence::Fix),
        Some("RMC") => parse_rmc(&fields).map(Sentence::Recommended),
        _ => Err(NmeaError::Unsupported(kind.to_string())),
    }
}

/// XOR of every byte between `$` and `*`.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

fn verify_checksum(body: &str, field: &str) -> Result<(), NmeaError> {
    let field = field.trim();
    let expected = u8::from_str_radix(field, 16)
        .map_err(|_| NmeaError::MalformedChecksum(field.to_string()))?;
    let computed = checksum(body);
    if expected != computed {
        return Err(NmeaError::Checksum { expected, computed });
    }
    Ok(())
}

fn require(kind: &'static str, fields: &[&str], needed: usize) -> Result<(), NmeaError> {
    if fields.len() < needed {
        return Err(NmeaError::TooFewFields {
            kind,
            found: fields.len(),
            needed,
        });
    }
    Ok(())
}

// $GPGGA,hhmmss.ss,llll.ll,a,yyyyy.yy,a,q,nn,h.h,a.a,M,g.g,M,...
fn parse_gga(f: &[&str]) -> Result<FixData, NmeaError> {
    require("GGA", f, 10)?;
    Ok(FixData {
        time: parse_time(f[1]),
        latitude: parse_coordinate("latitude", f[2], f[3])?,
        longitude: parse_coordinate("longitude", f[4], f[5])?,
        fix_quality: parse_number("fix quality", f[6])?,
        satellites: parse_number("satellites", f[7])?,
        altitude: parse_number("altitude", f[9])?,
    })
}

// $GPRMC,hhmmss.ss,A,llll.ll,a,yyyyy.yy,a,x.x,x.x,ddmmyy,...
fn parse_rmc(f: &[&str]) -> Result<RecommendedMinimum, NmeaError> {
    require("RMC", f, 10)?;
    let validity = match f[2] {
        "" => 'V',
        v if v.len() == 1 => v.chars().next().unwrap_or('V'),
        v => {
            return Err(NmeaError::InvalidField {
                field: "validity",
                value: v.to_string(),
            });
        }
    };
    Ok(RecommendedMinimum {
        time: parse_time(f[1]),
        validity,
        latitude: parse_coordinate("latitude", f[3], f[4])?,
        longitude: parse_coordinate("longitude", f[5], f[6])?,
        speed_knots: parse_number("speed", f[7])?,
        course: parse_number("course", f[8])?,
    })
}

/// Empty fields decode to the type's zero value.
fn parse_number<T>(field: &'static str, value: &str) -> Result<T, NmeaError>
where
    T: std::str::FromStr + Default,
{
    if value.is_empty() {
        return Ok(T::default());
    }
    value.parse().map_err(|_| NmeaError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// `DDMM.mmmm` / `DDDMM.mmmm` plus hemisphere to signed decimal degrees.
fn parse_coordinate(field: &'static str, value: &str, hemisphere: &str) -> Result<f64, NmeaError> {
    if value.is_empty() {
        return Ok(0.0);
    }
    let invalid = || NmeaError::InvalidField {
        field,
        value: value.to_string(),
    };
    // Lossy-decoded serial noise can put multi-byte characters here.
    if !value.is_ascii() {
        return Err(invalid());
    }
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return Err(invalid());
    }
    let degrees: f64 = value[..dot - 2].parse().map_err(|_| invalid())?;
    let minutes: f64 = value[dot - 2..].parse().map_err(|_| invalid())?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "S" | "W" => Ok(-decimal),
        _ => Ok(decimal),
    }
}

/// `hhmmss[.sss]`; anything unparseable is midnight, like an empty field.
fn parse_time(value: &str) -> NaiveTime {
    let (clock, fraction) = value.split_once('.').unwrap_or((value, ""));
    if clock.len() != 6 || !clock.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveTime::MIN;
    }
    let part = |range: std::ops::Range<usize>| clock[range].parse::<u32>().unwrap_or(0);
    let millis = fraction
        .chars()
        .chain(std::iter::repeat('0'))
        .take(3)
        .collect::<String>()
        .parse::<u32>()
        .unwrap_or(0);
    NaiveTime::from_hms_milli_opt(part(0..2), part(2..4), part(4..6), millis)
        .unwrap_or(NaiveTime::MIN)
}
