//! Parameter and reply field codec.
//!
//! Maps between typed [`Value`]s and payload bytes according to the
//! encoding rules a [`CommandDefinition`](crate::registry::CommandDefinition)
//! declares. Numeric fields are little-endian raw integers with a linear
//! `raw * factor + offset` mapping; enum fields go through their value
//! table; text fields are fixed-width ASCII padded with spaces.

use crate::error::BusError;
use crate::frame::Payload;
use crate::registry::{Encoding, FieldDef, ReplyValues, Value};

/// Encodes textual arguments (one per declared field) into a payload.
pub fn encode_args(fields: &[FieldDef], args: &[&str]) -> Result<Payload, BusError> {
    if args.len() != fields.len() {
        return Err(BusError::InvalidArgument(format!(
            "expected {} argument(s), got {}",
            fields.len(),
            args.len()
        )));
    }
    let values = fields
        .iter()
        .zip(args)
        .map(|(field, arg)| parse_arg(field, arg))
        .collect::<Result<Vec<_>, _>>()?;
    encode_values(fields, &values)
}

/// Encodes typed values (one per declared field) into a payload.
pub fn encode_values(fields: &[FieldDef], values: &[Value]) -> Result<Payload, BusError> {
    if values.len() != fields.len() {
        return Err(BusError::InvalidArgument(format!(
            "expected {} value(s), got {}",
            fields.len(),
            values.len()
        )));
    }
    let mut payload = Payload::new();
    for (field, value) in fields.iter().zip(values) {
        encode_field(field, value, &mut payload)?;
    }
    Ok(payload)
}

/// Decodes a reply payload against the declared field layout.
///
/// A payload shorter than the layout is a [`BusError::MalformedReply`];
/// trailing bytes beyond the layout are ignored (devices append vendor
/// padding on some commands).
pub fn decode_fields(fields: &[FieldDef], payload: &[u8]) -> Result<ReplyValues, BusError> {
    let mut values = ReplyValues::with_capacity(fields.len());
    let mut pos = 0usize;
    for field in fields {
        let width = field.encoding.width();
        let end = pos + width;
        if end > payload.len() {
            return Err(BusError::MalformedReply(format!(
                "field '{}' needs {} byte(s) at offset {}, payload has {}",
                field.name,
                width,
                pos,
                payload.len()
            )));
        }
        let value = decode_field(field, &payload[pos..end])?;
        values.push((field.name.clone(), value));
        pos = end;
    }
    Ok(values)
}

fn parse_arg(field: &FieldDef, arg: &str) -> Result<Value, BusError> {
    match &field.encoding {
        Encoding::Numeric { .. } => arg.parse::<f64>().map(Value::Number).map_err(|_| {
            BusError::InvalidArgument(format!("field '{}': '{}' is not numeric", field.name, arg))
        }),
        Encoding::Enum { .. } | Encoding::Text { .. } => Ok(Value::Text(arg.to_string())),
    }
}

fn encode_field(field: &FieldDef, value: &Value, out: &mut Payload) -> Result<(), BusError> {
    match (&field.encoding, value) {
        (Encoding::Numeric { width, factor, offset }, Value::Number(v)) => {
            let raw = ((v - offset) / factor).round();
            let max = if *width >= 8 {
                u64::MAX as f64
            } else {
                ((1u64 << (u64::from(*width) * 8)) - 1) as f64
            };
            if !(0.0..=max).contains(&raw) {
                return Err(BusError::InvalidArgument(format!(
                    "field '{}': value {} outside encodable range",
                    field.name, v
                )));
            }
            let raw = raw as u64;
            for i in 0..*width {
                push_byte(field, out, (raw >> (8 * u32::from(i))) as u8)?;
            }
            Ok(())
        }
        (Encoding::Enum { table }, value) => {
            let raw = match value {
                Value::Text(name) => table
                    .iter()
                    .find(|(_, n)| n == name)
                    .map(|(raw, _)| *raw),
                Value::Number(n) => {
                    let candidate = *n as u8;
                    table
                        .iter()
                        .find(|(raw, _)| *raw == candidate)
                        .map(|(raw, _)| *raw)
                }
            };
            match raw {
                Some(raw) => push_byte(field, out, raw),
                None => Err(BusError::InvalidArgument(format!(
                    "field '{}': '{}' not in value table",
                    field.name, value
                ))),
            }
        }
        (Encoding::Text { len }, Value::Text(s)) => {
            if !s.is_ascii() || s.len() > *len as usize {
                return Err(BusError::InvalidArgument(format!(
                    "field '{}': text exceeds {} ASCII byte(s)",
                    field.name, len
                )));
            }
            for &b in s.as_bytes() {
                push_byte(field, out, b)?;
            }
            for _ in s.len()..*len as usize {
                push_byte(field, out, b' ')?;
            }
            Ok(())
        }
        (_, value) => Err(BusError::InvalidArgument(format!(
            "field '{}': value '{}' does not match encoding",
            field.name, value
        ))),
    }
}

fn push_byte(field: &FieldDef, out: &mut Payload, byte: u8) -> Result<(), BusError> {
    out.push(byte).map_err(|_| {
        BusError::InvalidArgument(format!(
            "field '{}': encoded parameters exceed maximum payload",
            field.name
        ))
    })
}

fn decode_field(field: &FieldDef, bytes: &[u8]) -> Result<Value, BusError> {
    match &field.encoding {
        Encoding::Numeric { factor, offset, .. } => {
            let mut raw: u64 = 0;
            for (i, &b) in bytes.iter().enumerate() {
                raw |= u64::from(b) << (8 * i);
            }
            Ok(Value::Number(raw as f64 * factor + offset))
        }
        Encoding::Enum { table } => {
            let raw = bytes[0];
            table
                .iter()
                .find(|(value, _)| *value == raw)
                .map(|(_, name)| Value::Text(name.clone()))
                .ok_or_else(|| {
                    BusError::MalformedReply(format!(
                        "field '{}': byte 0x{:02X} not in value table",
                        field.name, raw
                    ))
                })
        }
        Encoding::Text { .. } => {
            let text = std::str::from_utf8(bytes).map_err(|_| {
                BusError::MalformedReply(format!("field '{}': non-ASCII text", field.name))
            })?;
            Ok(Value::Text(text.trim_end_matches([' ', '\0']).to_string()))
        }
    }
}
