//! S7 address syntax
//!
//! Supported forms:
//!
//! | Form              | Meaning                          |
//! |-------------------|----------------------------------|
//! | `DB1,X0.3`        | bit 3 of byte 0 in DB1           |
//! | `DB1,BYTE2` `B2`  | unsigned byte                    |
//! | `DB1,INT4` `I4`   | signed 16-bit                    |
//! | `DB1,WORD4` `W4`  | unsigned 16-bit                  |
//! | `DB1,DINT8` `DI8` | signed 32-bit                    |
//! | `DB1,DWORD8` `DW8`| unsigned 32-bit                  |
//! | `DB1,REAL8` `R8`  | IEEE 754 single                  |
//! | `M0.1` `I0.0` `Q1.7` | area bit (`E`/`A` accepted for `I`/`Q`) |
//! | `MB1` `MW2` `MD4` `MI2` `MDI4` `MR8` | typed area access |

use std::fmt;
use std::str::FromStr;

use crate::plc::driver::{DriverError, PlcValue};

/// Memory area codes used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Inputs,
    Outputs,
    Flags,
    DataBlock,
}

impl Area {
    pub fn code(self) -> u8 {
        match self {
            Self::Inputs => 0x81,
            Self::Outputs => 0x82,
            Self::Flags => 0x83,
            Self::DataBlock => 0x84,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bit,
    Byte,
    Int,
    Word,
    DInt,
    DWord,
    Real,
}

impl DataType {
    pub fn byte_len(self) -> usize {
        match self {
            Self::Bit | Self::Byte => 1,
            Self::Int | Self::Word => 2,
            Self::DInt | Self::DWord | Self::Real => 4,
        }
    }

    fn from_db_token(token: &str) -> Option<Self> {
        Some(match token {
            "X" => Self::Bit,
            "B" | "BYTE" => Self::Byte,
            "I" | "INT" => Self::Int,
            "W" | "WORD" => Self::Word,
            "DI" | "DINT" => Self::DInt,
            "DW" | "DWORD" => Self::DWord,
            "R" | "REAL" => Self::Real,
            _ => return None,
        })
    }

    fn from_area_token(token: &str) -> Option<Self> {
        Some(match token {
            "B" => Self::Byte,
            "W" => Self::Word,
            "D" => Self::DWord,
            "I" => Self::Int,
            "DI" => Self::DInt,
            "R" => Self::Real,
            _ => return None,
        })
    }
}

/// Parsed S7 address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Address {
    pub area: Area,
    /// DB number; 0 outside data blocks
    pub db: u16,
    pub byte: u32,
    pub bit: u8,
    pub data_type: DataType,
}

fn invalid(address: &str, reason: &str) -> DriverError {
    DriverError::failed(format!("invalid S7 address '{}': {}", address, reason))
}

/// Split `"INT12"` into `("INT", "12")`
fn split_type(s: &str) -> (&str, &str) {
    let idx = s.find(|c: char| c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(idx)
}

fn parse_offset(raw: &str, offset: &str, data_type: DataType) -> Result<(u32, u8), DriverError> {
    match (data_type, offset.split_once('.')) {
        (DataType::Bit, Some((byte, bit))) => {
            let byte = byte
                .parse::<u32>()
                .map_err(|_| invalid(raw, "bad byte offset"))?;
            let bit = bit.parse::<u8>().map_err(|_| invalid(raw, "bad bit number"))?;
            if bit > 7 {
                return Err(invalid(raw, "bit number must be 0-7"));
            }
            Ok((byte, bit))
        },
        (DataType::Bit, None) => Err(invalid(raw, "bit access needs <byte>.<bit>")),
        (_, Some(_)) => Err(invalid(raw, "array/bit suffix not supported for this type")),
        (_, None) => offset
            .parse::<u32>()
            .map(|byte| (byte, 0))
            .map_err(|_| invalid(raw, "bad byte offset")),
    }
}

impl FromStr for S7Address {
    type Err = DriverError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let upper = raw.trim().to_ascii_uppercase();

        if let Some(rest) = upper.strip_prefix("DB") {
            let (db, item) = rest
                .split_once(',')
                .ok_or_else(|| invalid(raw, "expected DB<n>,<type><offset>"))?;
            let db = db.parse::<u16>().map_err(|_| invalid(raw, "bad DB number"))?;
            let (token, offset) = split_type(item);
            let data_type =
                DataType::from_db_token(token).ok_or_else(|| invalid(raw, "unknown data type"))?;
            let (byte, bit) = parse_offset(raw, offset, data_type)?;
            return Ok(Self {
                area: Area::DataBlock,
                db,
                byte,
                bit,
                data_type,
            });
        }

        let mut chars = upper.chars();
        let area = match chars.next() {
            Some('I' | 'E') => Area::Inputs,
            Some('Q' | 'A') => Area::Outputs,
            Some('M') => Area::Flags,
            _ => return Err(invalid(raw, "unknown memory area")),
        };
        let rest = chars.as_str();
        let (token, offset) = split_type(rest);
        let data_type = if token.is_empty() {
            DataType::Bit
        } else {
            DataType::from_area_token(token).ok_or_else(|| invalid(raw, "unknown data type"))?
        };
        let (byte, bit) = parse_offset(raw, offset, data_type)?;
        Ok(Self {
            area,
            db: 0,
            byte,
            bit,
            data_type,
        })
    }
}

impl fmt::Display for S7Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let area = match self.area {
            Area::DataBlock => {
                return write!(
                    f,
                    "DB{},{:?}{}.{}",
                    self.db, self.data_type, self.byte, self.bit
                )
            },
            Area::Inputs => "I",
            Area::Outputs => "Q",
            Area::Flags => "M",
        };
        write!(f, "{}{:?}{}.{}", area, self.data_type, self.byte, self.bit)
    }
}

impl S7Address {
    pub fn is_bit(&self) -> bool {
        self.data_type == DataType::Bit
    }

    /// Transport size in the request item (BIT or BYTE)
    pub fn request_transport(&self) -> u8 {
        if self.is_bit() {
            0x01
        } else {
            0x02
        }
    }

    /// Number of elements in the request item
    pub fn request_count(&self) -> u16 {
        if self.is_bit() {
            1
        } else {
            self.data_type.byte_len() as u16
        }
    }

    /// Start address in bits, packed into 24 bits on the wire
    pub fn bit_address(&self) -> u32 {
        (self.byte << 3) | u32::from(self.bit)
    }

    /// Decode response data for this address
    pub fn decode(&self, data: &[u8]) -> Result<PlcValue, DriverError> {
        let need = self.data_type.byte_len();
        if data.len() < need {
            return Err(DriverError::failed(format!(
                "short response for {}: {} byte(s), expected {}",
                self,
                data.len(),
                need
            )));
        }
        Ok(match self.data_type {
            DataType::Bit => PlcValue::Bool(data[0] & 0x01 != 0),
            DataType::Byte => PlcValue::Int(i64::from(data[0])),
            DataType::Int => PlcValue::Int(i64::from(i16::from_be_bytes([data[0], data[1]]))),
            DataType::Word => PlcValue::Int(i64::from(u16::from_be_bytes([data[0], data[1]]))),
            DataType::DInt => PlcValue::Int(i64::from(i32::from_be_bytes([
                data[0], data[1], data[2], data[3],
            ]))),
            DataType::DWord => PlcValue::Int(i64::from(u32::from_be_bytes([
                data[0], data[1], data[2], data[3],
            ]))),
            DataType::Real => PlcValue::Real(f64::from(f32::from_be_bytes([
                data[0], data[1], data[2], data[3],
            ]))),
        })
    }

    /// Encode a value for a write to this address
    pub fn encode(&self, value: &PlcValue) -> Result<Vec<u8>, DriverError> {
        let mismatch = || {
            DriverError::failed(format!(
                "cannot write {} value {} to {}",
                value.type_name(),
                value,
                self
            ))
        };
        let int = || value.as_i64().ok_or_else(mismatch);

        Ok(match self.data_type {
            DataType::Bit => vec![u8::from(value.as_bool().ok_or_else(mismatch)?)],
            DataType::Byte => vec![u8::try_from(int()?).map_err(|_| mismatch())?],
            DataType::Int => i16::try_from(int()?)
                .map_err(|_| mismatch())?
                .to_be_bytes()
                .to_vec(),
            DataType::Word => u16::try_from(int()?)
                .map_err(|_| mismatch())?
                .to_be_bytes()
                .to_vec(),
            DataType::DInt => i32::try_from(int()?)
                .map_err(|_| mismatch())?
                .to_be_bytes()
                .to_vec(),
            DataType::DWord => u32::try_from(int()?)
                .map_err(|_| mismatch())?
                .to_be_bytes()
                .to_vec(),
            DataType::Real => (value.as_f64().ok_or_else(mismatch)? as f32)
                .to_be_bytes()
                .to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> S7Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_db_bit() {
        let addr = parse("DB1,X0.3");
        assert_eq!(addr.area, Area::DataBlock);
        assert_eq!(addr.db, 1);
        assert_eq!((addr.byte, addr.bit), (0, 3));
        assert_eq!(addr.data_type, DataType::Bit);
        assert_eq!(addr.bit_address(), 3);
        assert_eq!(addr.request_transport(), 0x01);
    }

    #[test]
    fn test_db_typed_forms() {
        assert_eq!(parse("DB10,INT4").data_type, DataType::Int);
        assert_eq!(parse("db10,i4").data_type, DataType::Int);
        assert_eq!(parse("DB2,REAL8").data_type, DataType::Real);
        assert_eq!(parse("DB2,DW8").data_type, DataType::DWord);
        assert_eq!(parse("DB2,DINT8").data_type, DataType::DInt);
        assert_eq!(parse("DB2,BYTE1").request_count(), 1);
        assert_eq!(parse("DB2,WORD6").bit_address(), 48);
    }

    #[test]
    fn test_area_forms() {
        let m = parse("M0.1");
        assert_eq!((m.area, m.data_type, m.bit), (Area::Flags, DataType::Bit, 1));
        assert_eq!(parse("E1.0").area, Area::Inputs);
        assert_eq!(parse("Q2.7").area, Area::Outputs);
        assert_eq!(parse("MW10").data_type, DataType::Word);
        assert_eq!(parse("MR20").data_type, DataType::Real);
        assert_eq!(parse("MDI4").data_type, DataType::DInt);
        assert_eq!(parse("IB0").data_type, DataType::Byte);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "DB1", "DB1,X0", "DB1,X0.8", "DBx,INT0", "DB1,FOO2", "Z0.0", "MW", "DB1,INT2.1"] {
            assert!(bad.parse::<S7Address>().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_decode_values() {
        assert_eq!(parse("DB1,X0.0").decode(&[0x01]).unwrap(), PlcValue::Bool(true));
        assert_eq!(parse("DB1,INT0").decode(&[0xFF, 0xFE]).unwrap(), PlcValue::Int(-2));
        assert_eq!(parse("DB1,WORD0").decode(&[0xFF, 0xFE]).unwrap(), PlcValue::Int(65534));
        assert_eq!(
            parse("DB1,REAL0").decode(&1.5f32.to_be_bytes()).unwrap(),
            PlcValue::Real(1.5)
        );
        assert!(parse("DB1,DINT0").decode(&[0, 1]).is_err());
    }

    #[test]
    fn test_encode_values() {
        assert_eq!(parse("DB1,X0.0").encode(&PlcValue::Bool(true)).unwrap(), vec![1]);
        assert_eq!(parse("DB1,INT0").encode(&PlcValue::Int(-2)).unwrap(), vec![0xFF, 0xFE]);
        assert_eq!(parse("DB1,BYTE0").encode(&PlcValue::Int(200)).unwrap(), vec![200]);
        assert!(parse("DB1,BYTE0").encode(&PlcValue::Int(300)).is_err());
        assert!(parse("DB1,X0.0").encode(&PlcValue::Real(1.0)).is_err());
        assert_eq!(
            parse("DB1,REAL0").encode(&PlcValue::Int(2)).unwrap(),
            2.0f32.to_be_bytes().to_vec()
        );
    }
}
