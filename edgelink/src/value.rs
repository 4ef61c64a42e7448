use serde::{Deserialize, Serialize};

use crate::status::{AgentError, ErrorKind, Result};

/// Type tag of a [`TypedValue`]. Declared parameter and telemetry types are
/// expressed in terms of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
    Raw,
    Location,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        !matches!(
            self,
            DataType::Bool | DataType::String | DataType::Raw | DataType::Location
        )
    }
}

/// Where a location fix came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    #[default]
    Unknown,
    Fixed,
    Gps,
    Wifi,
    M2mLocate,
}

impl LocationSource {
    /// Name used on the wire in the `fixType` field.
    pub fn wire_name(self) -> &'static str {
        match self {
            LocationSource::Fixed => "manual",
            LocationSource::Gps => "gps",
            LocationSource::Wifi => "wifi",
            LocationSource::Unknown | LocationSource::M2mLocate => "m2m-locate",
        }
    }
}

/// A geodetic sample. Latitude and longitude are mandatory; every other field
/// is optional and is only put on the wire when it has been set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<LocationSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Location {
    /// Creates a location sample, validating the coordinate ranges.
    pub fn new(latitude: f64, longitude: f64) -> Result<Location> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(AgentError::new(
                ErrorKind::OutOfRange,
                format!("latitude {latitude} outside -90..90"),
            ));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(AgentError::new(
                ErrorKind::OutOfRange,
                format!("longitude {longitude} outside -180..180"),
            ));
        }
        Ok(Location {
            latitude,
            longitude,
            ..Location::default()
        })
    }

    pub fn set_heading(&mut self, heading: f64) -> Result<()> {
        if !(0.0..=360.0).contains(&heading) {
            return Err(AgentError::new(
                ErrorKind::OutOfRange,
                format!("heading {heading} outside 0..360"),
            ));
        }
        self.heading = Some(heading);
        Ok(())
    }
}

/// Tagged value used uniformly for telemetry samples, attribute values and
/// action parameters in both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Raw(Vec<u8>),
    Location(Location),
}

impl TypedValue {
    pub fn data_type(&self) -> DataType {
        match self {
            TypedValue::Bool(_) => DataType::Bool,
            TypedValue::I8(_) => DataType::I8,
            TypedValue::I16(_) => DataType::I16,
            TypedValue::I32(_) => DataType::I32,
            TypedValue::I64(_) => DataType::I64,
            TypedValue::U8(_) => DataType::U8,
            TypedValue::U16(_) => DataType::U16,
            TypedValue::U32(_) => DataType::U32,
            TypedValue::U64(_) => DataType::U64,
            TypedValue::F32(_) => DataType::F32,
            TypedValue::F64(_) => DataType::F64,
            TypedValue::String(_) => DataType::String,
            TypedValue::Raw(_) => DataType::Raw,
            TypedValue::Location(_) => DataType::Location,
        }
    }

    /// Signed view of an integral value, when it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TypedValue::I8(v) => Some(i64::from(*v)),
            TypedValue::I16(v) => Some(i64::from(*v)),
            TypedValue::I32(v) => Some(i64::from(*v)),
            TypedValue::I64(v) => Some(*v),
            TypedValue::U8(v) => Some(i64::from(*v)),
            TypedValue::U16(v) => Some(i64::from(*v)),
            TypedValue::U32(v) => Some(i64::from(*v)),
            TypedValue::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            TypedValue::I8(v) => u64::try_from(*v).ok(),
            TypedValue::I16(v) => u64::try_from(*v).ok(),
            TypedValue::I32(v) => u64::try_from(*v).ok(),
            TypedValue::I64(v) => u64::try_from(*v).ok(),
            TypedValue::U8(v) => Some(u64::from(*v)),
            TypedValue::U16(v) => Some(u64::from(*v)),
            TypedValue::U32(v) => Some(u64::from(*v)),
            TypedValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::F32(v) => Some(f64::from(*v)),
            TypedValue::F64(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    /// Converts the value to `target`, allowing widening of numeric values.
    /// Narrowing that would lose range is rejected with `bad-parameter`;
    /// conversions between unrelated type families are rejected as well.
    pub fn convert_to(&self, target: DataType) -> Result<TypedValue> {
        if self.data_type() == target {
            return Ok(self.clone());
        }

        fn bad(value: &TypedValue, target: DataType) -> AgentError {
            AgentError::new(
                ErrorKind::BadParameter,
                format!("cannot convert {:?} to {target:?}", value.data_type()),
            )
        }

        match target {
            DataType::I8 => self
                .as_i64()
                .and_then(|v| i8::try_from(v).ok())
                .map(TypedValue::I8)
                .ok_or_else(|| bad(self, target)),
            DataType::I16 => self
                .as_i64()
                .and_then(|v| i16::try_from(v).ok())
                .map(TypedValue::I16)
                .ok_or_else(|| bad(self, target)),
            DataType::I32 => self
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(TypedValue::I32)
                .ok_or_else(|| bad(self, target)),
            DataType::I64 => self
                .as_i64()
                .map(TypedValue::I64)
                .ok_or_else(|| bad(self, target)),
            DataType::U8 => self
                .as_u64()
                .and_then(|v| u8::try_from(v).ok())
                .map(TypedValue::U8)
                .ok_or_else(|| bad(self, target)),
            DataType::U16 => self
                .as_u64()
                .and_then(|v| u16::try_from(v).ok())
                .map(TypedValue::U16)
                .ok_or_else(|| bad(self, target)),
            DataType::U32 => self
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(TypedValue::U32)
                .ok_or_else(|| bad(self, target)),
            DataType::U64 => self
                .as_u64()
                .map(TypedValue::U64)
                .ok_or_else(|| bad(self, target)),
            DataType::F32 => match self {
                TypedValue::F32(v) => Ok(TypedValue::F32(*v)),
                _ => Err(bad(self, target)),
            },
            DataType::F64 => match self {
                TypedValue::F32(v) => Ok(TypedValue::F64(f64::from(*v))),
                TypedValue::F64(v) => Ok(TypedValue::F64(*v)),
                _ => self
                    .as_i64()
                    .map(|v| TypedValue::F64(v as f64))
                    .ok_or_else(|| bad(self, target)),
            },
            DataType::Bool | DataType::String | DataType::Raw | DataType::Location => {
                Err(bad(self, target))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn widening_is_permitted() {
        let v = TypedValue::I32(1234);
        assert_eq!(v.convert_to(DataType::I64).unwrap(), TypedValue::I64(1234));
        assert_eq!(
            TypedValue::U8(200).convert_to(DataType::U64).unwrap(),
            TypedValue::U64(200)
        );
        assert_eq!(
            TypedValue::F32(1.5).convert_to(DataType::F64).unwrap(),
            TypedValue::F64(1.5)
        );
    }

    #[test]
    fn narrowing_that_loses_range_is_rejected() {
        let v = TypedValue::I64(300);
        assert_eq!(
            v.convert_to(DataType::I8).unwrap_err().kind(),
            ErrorKind::BadParameter
        );
        assert_eq!(
            TypedValue::I32(-1).convert_to(DataType::U32).unwrap_err().kind(),
            ErrorKind::BadParameter
        );
    }

    #[test]
    fn narrowing_that_fits_is_permitted() {
        assert_eq!(
            TypedValue::I64(-5).convert_to(DataType::I8).unwrap(),
            TypedValue::I8(-5)
        );
    }

    #[test]
    fn cross_family_conversion_is_rejected() {
        assert_eq!(
            TypedValue::String("x".into())
                .convert_to(DataType::I64)
                .unwrap_err()
                .kind(),
            ErrorKind::BadParameter
        );
        assert_eq!(
            TypedValue::Bool(true)
                .convert_to(DataType::I64)
                .unwrap_err()
                .kind(),
            ErrorKind::BadParameter
        );
    }

    #[test]
    fn numeric_boundaries_survive_conversion() {
        assert_eq!(
            TypedValue::I8(i8::MIN).convert_to(DataType::I64).unwrap(),
            TypedValue::I64(i64::from(i8::MIN))
        );
        assert_eq!(
            TypedValue::U64(u64::MAX).convert_to(DataType::U64).unwrap(),
            TypedValue::U64(u64::MAX)
        );
        assert!(TypedValue::U64(u64::MAX).convert_to(DataType::I64).is_err());
    }

    #[test]
    fn location_range_validation() {
        assert!(Location::new(45.0, -122.0).is_ok());
        assert_eq!(
            Location::new(91.0, 0.0).unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
        assert_eq!(
            Location::new(0.0, 200.0).unwrap_err().kind(),
            ErrorKind::OutOfRange
        );

        let mut loc = Location::new(0.0, 0.0).unwrap();
        assert!(loc.set_heading(359.9).is_ok());
        assert_eq!(
            loc.set_heading(400.0).unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
    }
}
