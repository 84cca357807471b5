//! Wire-level data model and text grammar for telemetry lines.
//!
//! A telemetry line looks like `1A78.45 B83.82 K0.13,-0.39,-9.81 U14.41`:
//! the peripheral address as ASCII digits, immediately followed by
//! space-separated `<tag><value>` fields. Acceleration-class tags carry
//! three comma-joined values (X,Y,Z).

use arrayvec::ArrayString;
use core::fmt::{self, Write as _};
use core::str::FromStr;
use heapless::Vec;
use serde::{Deserialize, Serialize, Serializer};
use static_assertions::const_assert;

/// One device per ASCII uppercase letter.
pub const MAX_DEVICES: usize = 26;
/// Addresses are single ASCII digits on the poll side.
pub const MAX_PERIPHERALS: usize = 10;
pub const MAX_LINE_LEN: usize = 1024;

/// Marker emitted in place of a value when a device could not be read.
pub const UNAVAILABLE_TOKEN: &str = "nan";

// Widest scalar is "-999999.99".
const MAX_SCALAR_LEN: usize = 10;
// Tag, three scalars, two commas, one separating space.
const MAX_FIELD_LEN: usize = 1 + 3 * MAX_SCALAR_LEN + 2 + 1;
// Address digit, every field, trailing newline.
const_assert!(MAX_LINE_LEN >= 1 + MAX_DEVICES * MAX_FIELD_LEN + 1);

pub type LineBuffer = ArrayString<MAX_LINE_LEN>;

/// Numeric identity of one node on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PeripheralAddress(u8);

impl PeripheralAddress {
    pub const MAX: u8 = 9;

    pub const fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    /// The single byte the collector writes to poll this peripheral.
    pub const fn poll_byte(self) -> u8 {
        b'0' + self.0
    }

    pub fn from_poll_byte(byte: u8) -> Option<Self> {
        if byte.is_ascii_digit() {
            Some(Self(byte - b'0'))
        } else {
            None
        }
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peripheral address {0} out of range 0..=9")]
pub struct AddressOutOfRange(pub u8);

impl TryFrom<u8> for PeripheralAddress {
    type Error = AddressOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(AddressOutOfRange(value))
    }
}

impl From<PeripheralAddress> for u8 {
    fn from(address: PeripheralAddress) -> Self {
        address.0
    }
}

/// Sensor class, implied by the letter range a tag falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Temperature,
    Acceleration,
    Pressure,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 3] = [
        DeviceClass::Temperature,
        DeviceClass::Acceleration,
        DeviceClass::Pressure,
    ];

    /// Inclusive letter range reserved for this class.
    pub const fn tag_range(self) -> (char, char) {
        match self {
            DeviceClass::Temperature => ('A', 'J'),
            DeviceClass::Acceleration => ('K', 'T'),
            DeviceClass::Pressure => ('U', 'Z'),
        }
    }

    pub const fn axis_count(self) -> usize {
        match self {
            DeviceClass::Acceleration => 3,
            DeviceClass::Temperature | DeviceClass::Pressure => 1,
        }
    }

    pub const fn unit(self) -> &'static str {
        match self {
            DeviceClass::Temperature => "°F",
            DeviceClass::Acceleration => "m/s²",
            DeviceClass::Pressure => "psi",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceClass::Temperature => "temperature",
            DeviceClass::Acceleration => "acceleration",
            DeviceClass::Pressure => "pressure",
        };
        f.write_str(name)
    }
}

/// Single-letter identifier of one device inside a peripheral's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct DeviceTag(u8);

impl DeviceTag {
    pub fn new(letter: char) -> Option<Self> {
        if letter.is_ascii_uppercase() {
            Some(Self(letter as u8))
        } else {
            None
        }
    }

    pub fn as_char(self) -> char {
        char::from(self.0)
    }

    pub fn class(self) -> DeviceClass {
        match self.0 {
            b'A'..=b'J' => DeviceClass::Temperature,
            b'K'..=b'T' => DeviceClass::Acceleration,
            _ => DeviceClass::Pressure,
        }
    }
}

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char(self.as_char())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a device tag (expected A-Z)")]
pub struct InvalidTag(pub char);

impl TryFrom<char> for DeviceTag {
    type Error = InvalidTag;

    fn try_from(letter: char) -> Result<Self, Self::Error> {
        Self::new(letter).ok_or(InvalidTag(letter))
    }
}

impl From<DeviceTag> for char {
    fn from(tag: DeviceTag) -> Self {
        tag.as_char()
    }
}

/// Fixed two-decimal value stored as integer hundredths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Decimal2(i32);

impl Decimal2 {
    pub const MAX_HUNDREDTHS: i32 = 99_999_999;

    pub const fn from_hundredths(hundredths: i32) -> Option<Self> {
        if hundredths.abs() <= Self::MAX_HUNDREDTHS {
            Some(Self(hundredths))
        } else {
            None
        }
    }

    /// Rounds to the nearest hundredth. `None` for non-finite or out-of-range input.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * 100.0).round();
        if scaled.abs() > f64::from(Self::MAX_HUNDREDTHS) {
            return None;
        }
        Some(Self(scaled as i32))
    }

    pub const fn hundredths(self) -> i32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl fmt::Display for Decimal2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, magnitude / 100, magnitude % 100)
    }
}

impl FromStr for Decimal2 {
    type Err = ();

    /// Accepts only `-?<digits>.<two digits>`, the form the encoder emits.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (negative, magnitude) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (whole, fraction) = magnitude.split_once('.').ok_or(())?;
        if whole.is_empty()
            || fraction.len() != 2
            || !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit())
        {
            return Err(());
        }
        // Digits only from here; parsing fails on overflow alone.
        let whole: i32 = whole.parse().map_err(|_| ())?;
        let fraction: i32 = fraction.parse().map_err(|_| ())?;
        let hundredths = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(fraction))
            .ok_or(())?;
        Self::from_hundredths(if negative { -hundredths } else { hundredths }).ok_or(())
    }
}

impl Serialize for Decimal2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

/// Value reported for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reading {
    Scalar(Decimal2),
    Triaxial([Decimal2; 3]),
    /// Sensor read failed; carried on the wire as `nan`.
    Unavailable,
}

impl Reading {
    pub fn scalar(value: f64) -> Option<Self> {
        Decimal2::from_f64(value).map(Reading::Scalar)
    }

    pub fn triaxial(x: f64, y: f64, z: f64) -> Option<Self> {
        Some(Reading::Triaxial([
            Decimal2::from_f64(x)?,
            Decimal2::from_f64(y)?,
            Decimal2::from_f64(z)?,
        ]))
    }

    /// Whether this reading has the shape a device of `class` reports.
    pub fn fits(&self, class: DeviceClass) -> bool {
        match self {
            Reading::Scalar(_) => class.axis_count() == 1,
            Reading::Triaxial(_) => class.axis_count() == 3,
            Reading::Unavailable => true,
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, Reading::Unavailable)
    }

    pub fn values(&self) -> &[Decimal2] {
        match self {
            Reading::Scalar(value) => core::slice::from_ref(value),
            Reading::Triaxial(axes) => axes,
            Reading::Unavailable => &[],
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Scalar(value) => write!(f, "{}", value),
            Reading::Triaxial([x, y, z]) => write!(f, "{},{},{}", x, y, z),
            Reading::Unavailable => f.write_str(UNAVAILABLE_TOKEN),
        }
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reading::Scalar(value) => value.serialize(serializer),
            Reading::Triaxial(axes) => axes.serialize(serializer),
            Reading::Unavailable => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Field {
    pub tag: DeviceTag,
    pub reading: Reading,
}

/// Reasons a telemetry line is rejected. A rejected line yields no record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum MalformedMessage {
    #[error("empty line")]
    Empty,
    #[error("line contains non-ASCII data")]
    NotAscii,
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("missing peripheral address")]
    MissingAddress,
    #[error("invalid peripheral address `{0}`")]
    InvalidAddress(String),
    #[error("unrecognized peripheral address {0}")]
    UnknownAddress(PeripheralAddress),
    #[error("reply carries address {received} while polling {expected}")]
    AddressMismatch {
        expected: PeripheralAddress,
        received: PeripheralAddress,
    },
    #[error("unrecognized device tag `{0}`")]
    UnknownTag(char),
    #[error("duplicate device tag `{0}`")]
    DuplicateTag(char),
    #[error("invalid value `{text}` for tag `{tag}`")]
    InvalidValue { tag: char, text: String },
    #[error("tag `{tag}` expects {expected} value(s), found {found}")]
    WrongArity {
        tag: char,
        expected: usize,
        found: usize,
    },
    #[error("more than {limit} fields")]
    TooManyFields { limit: usize },
}

/// One peripheral's readings for one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryMessage {
    address: PeripheralAddress,
    fields: Vec<Field, MAX_DEVICES>,
}

impl TelemetryMessage {
    pub fn new(address: PeripheralAddress) -> Self {
        Self {
            address,
            fields: Vec::new(),
        }
    }

    /// Appends a field, enforcing tag uniqueness and the class's value count.
    pub fn push(&mut self, tag: DeviceTag, reading: Reading) -> Result<(), MalformedMessage> {
        if self.get(tag).is_some() {
            return Err(MalformedMessage::DuplicateTag(tag.as_char()));
        }
        let class = tag.class();
        if !reading.fits(class) {
            return Err(MalformedMessage::WrongArity {
                tag: tag.as_char(),
                expected: class.axis_count(),
                found: reading.values().len(),
            });
        }
        self.fields
            .push(Field { tag, reading })
            .map_err(|_| MalformedMessage::TooManyFields { limit: MAX_DEVICES })
    }

    pub fn with(mut self, tag: DeviceTag, reading: Reading) -> Result<Self, MalformedMessage> {
        self.push(tag, reading)?;
        Ok(self)
    }

    pub fn address(&self) -> PeripheralAddress {
        self.address
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn get(&self, tag: DeviceTag) -> Option<Reading> {
        self.fields.iter().find(|f| f.tag == tag).map(|f| f.reading)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Renders the message plus its terminating newline into a line buffer.
    pub fn encode_line(&self) -> Result<LineBuffer, MalformedMessage> {
        let mut line = LineBuffer::new();
        writeln!(line, "{}", self).map_err(|_| MalformedMessage::LineTooLong {
            limit: MAX_LINE_LEN,
        })?;
        Ok(line)
    }
}

impl fmt::Display for TelemetryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        for (index, field) in self.fields.iter().enumerate() {
            if index > 0 {
                f.write_char(' ')?;
            }
            write!(f, "{}{}", field.tag, field.reading)?;
        }
        Ok(())
    }
}

impl FromStr for TelemetryMessage {
    type Err = MalformedMessage;

    /// Grammar-level parse. Does not check the address against any bus
    /// configuration; `TelemetryDecoder` does that.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MalformedMessage::Empty);
        }
        if !line.is_ascii() {
            return Err(MalformedMessage::NotAscii);
        }
        if line.len() > MAX_LINE_LEN {
            return Err(MalformedMessage::LineTooLong {
                limit: MAX_LINE_LEN,
            });
        }

        let digits = line.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(MalformedMessage::MissingAddress);
        }
        let (address_text, rest) = line.split_at(digits);
        let address = address_text
            .parse::<u8>()
            .ok()
            .and_then(PeripheralAddress::new)
            .ok_or_else(|| MalformedMessage::InvalidAddress(address_text.to_string()))?;

        let mut message = TelemetryMessage::new(address);
        for token in rest.split_ascii_whitespace() {
            let (tag, reading) = parse_field(token)?;
            message.push(tag, reading)?;
        }
        Ok(message)
    }
}

fn parse_field(token: &str) -> Result<(DeviceTag, Reading), MalformedMessage> {
    // Token is ASCII, so splitting after the first byte is a char boundary.
    let (head, value) = token.split_at(1);
    let letter = head.chars().next().unwrap_or(' ');
    let tag = DeviceTag::new(letter).ok_or(MalformedMessage::UnknownTag(letter))?;

    if value == UNAVAILABLE_TOKEN {
        return Ok((tag, Reading::Unavailable));
    }

    let invalid = || MalformedMessage::InvalidValue {
        tag: letter,
        text: value.to_string(),
    };
    let mut parsed: Vec<Decimal2, 3> = Vec::new();
    let mut found = 0;
    for part in value.split(',') {
        found += 1;
        let number = part.parse::<Decimal2>().map_err(|_| invalid())?;
        // Overflow only means too many parts; the arity check below reports it.
        let _ = parsed.push(number);
    }

    let class = tag.class();
    if found != class.axis_count() {
        return Err(MalformedMessage::WrongArity {
            tag: letter,
            expected: class.axis_count(),
            found,
        });
    }
    let reading = match parsed.as_slice() {
        [value] => Reading::Scalar(*value),
        [x, y, z] => Reading::Triaxial([*x, *y, *z]),
        _ => return Err(invalid()),
    };
    Ok((tag, reading))
}
