//! Wire codec: [`Value`] ⇄ bytes in one of the enabled [`Format`]s.
//!
//! | Format | Encoding |
//! |---|---|
//! | [`Format::Binary`] | bincode of the `Value` tree; lossless |
//! | [`Format::Json`] | JSON; wide integers as strings, bytes as base64 |
//! | [`Format::Text`] | UTF-8; string messages only |
//! | [`Format::Raw`] | verbatim; byte messages only |
//!
//! JSON cannot carry integers beyond ±(2^53 − 1) or raw bytes, so those are
//! emitted as strings and restored when the payload is decoded against a
//! [`Schema`] naming the source type.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use zros_types::{DecodeError, EncodeError, Format, Schema, Value};

/// Largest integer magnitude a JSON double represents exactly.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Deepest `List`/`Map` nesting accepted from a binary payload; the same
/// limit `serde_json` applies to JSON input.
pub const MAX_DEPTH: usize = 128;

/// Result of [`Codec::encode_with_fallback`].
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub format: Format,
    /// `true` when the preferred format failed and the canonical one was used.
    pub fell_back: bool,
}

/// Result of [`Codec::decode_with_fallback`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub value: Value,
    pub format: Format,
    pub fell_back: bool,
}

/// Encoder/decoder restricted to an ordered list of enabled formats.
#[derive(Debug, Clone)]
pub struct Codec {
    enabled: Vec<Format>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Format::ALL)
    }
}

impl Codec {
    /// Build a codec for the given preference list.
    ///
    /// The canonical format is always enabled so fallback has a target.
    pub fn new(formats: impl IntoIterator<Item = Format>) -> Self {
        let mut enabled: Vec<Format> = Vec::new();
        for f in formats {
            if !enabled.contains(&f) {
                enabled.push(f);
            }
        }
        if !enabled.contains(&Format::CANONICAL) {
            enabled.push(Format::CANONICAL);
        }
        Self { enabled }
    }

    pub fn formats(&self) -> &[Format] {
        &self.enabled
    }

    pub fn supports(&self, format: Format) -> bool {
        self.enabled.contains(&format)
    }

    // -----------------------------------------------------------------------
    // Single-format primitives
    // -----------------------------------------------------------------------

    pub fn encode(&self, value: &Value, format: Format) -> Result<Vec<u8>, EncodeError> {
        if !self.supports(format) {
            return Err(EncodeError::Unsupported(format));
        }
        match format {
            Format::Binary => bincode::serialize(value).map_err(|e| EncodeError::Incompatible {
                format,
                reason: e.to_string(),
            }),
            Format::Json => {
                let json = to_safe_json(value)?;
                serde_json::to_vec(&json).map_err(|e| EncodeError::Incompatible {
                    format,
                    reason: e.to_string(),
                })
            }
            Format::Text => match value {
                Value::String(s) => Ok(s.as_bytes().to_vec()),
                other => Err(EncodeError::Incompatible {
                    format,
                    reason: format!("text carries strings, not {}", other.kind()),
                }),
            },
            Format::Raw => match value {
                Value::Bytes(b) => Ok(b.clone()),
                other => Err(EncodeError::Incompatible {
                    format,
                    reason: format!("raw carries bytes, not {}", other.kind()),
                }),
            },
        }
    }

    pub fn decode(&self, bytes: &[u8], format: Format, schema: &Schema) -> Result<Value, DecodeError> {
        if !self.supports(format) {
            return Err(DecodeError::Unsupported(format));
        }
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let value = match format {
            Format::Binary => {
                check_binary_depth(bytes).map_err(|reason| DecodeError::Malformed { format, reason })?;
                bincode::deserialize::<Value>(bytes).map_err(|e| DecodeError::Malformed {
                    format,
                    reason: e.to_string(),
                })?
            }
            Format::Json => serde_json::from_slice::<serde_json::Value>(bytes)
                .map(Value::from)
                .map_err(|e| DecodeError::Malformed {
                    format,
                    reason: e.to_string(),
                })?,
            Format::Text => std::str::from_utf8(bytes)
                .map(|s| Value::String(s.to_string()))
                .map_err(|e| DecodeError::Malformed {
                    format,
                    reason: e.to_string(),
                })?,
            Format::Raw => Value::Bytes(bytes.to_vec()),
        };
        conform(value, schema)
    }

    // -----------------------------------------------------------------------
    // Preferred-then-canonical
    // -----------------------------------------------------------------------

    /// Encode with `preferred`, retrying once with the canonical format.
    ///
    /// When both fail the error of the canonical attempt is returned.
    pub fn encode_with_fallback(&self, value: &Value, preferred: Format) -> Result<Encoded, EncodeError> {
        match self.encode(value, preferred) {
            Ok(bytes) => Ok(Encoded { bytes, format: preferred, fell_back: false }),
            Err(e) if preferred == Format::CANONICAL => Err(e),
            Err(_) => self.encode(value, Format::CANONICAL).map(|bytes| Encoded {
                bytes,
                format: Format::CANONICAL,
                fell_back: true,
            }),
        }
    }

    /// Decode with `preferred`, retrying once with the canonical format.
    ///
    /// An empty payload is never retried.
    pub fn decode_with_fallback(
        &self,
        bytes: &[u8],
        preferred: Format,
        schema: &Schema,
    ) -> Result<Decoded, DecodeError> {
        match self.decode(bytes, preferred, schema) {
            Ok(value) => Ok(Decoded { value, format: preferred, fell_back: false }),
            Err(DecodeError::Empty) => Err(DecodeError::Empty),
            Err(e) if preferred == Format::CANONICAL => Err(e),
            Err(_) => self.decode(bytes, Format::CANONICAL, schema).map(|value| Decoded {
                value,
                format: Format::CANONICAL,
                fell_back: true,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Binary layout check
// ---------------------------------------------------------------------------

/// Walk the bincode layout of a `Value` without recursing and reject
/// payloads nested deeper than [`MAX_DEPTH`].
///
/// bincode decodes `Value` recursively, so a peer could otherwise exhaust
/// the stack with a small frame of nested one-element lists.  Layout: a
/// little-endian `u32` variant tag, `u64` lengths, map entries as
/// `(string key, value)`.
fn check_binary_depth(bytes: &[u8]) -> Result<(), String> {
    struct Level {
        remaining: u64,
        map: bool,
    }

    let mut reader = Reader { bytes, pos: 0 };
    let mut open: Vec<Level> = Vec::new();
    loop {
        match reader.u32()? {
            0 => {}
            1 => reader.skip(1)?,
            2..=4 => reader.skip(8)?,
            5 | 6 => {
                let len = reader.u64()?;
                reader.skip(len)?;
            }
            tag @ (7 | 8) => {
                let len = reader.u64()?;
                if len > 0 {
                    if open.len() == MAX_DEPTH {
                        return Err(format!("nesting deeper than {MAX_DEPTH} levels"));
                    }
                    open.push(Level { remaining: len, map: tag == 8 });
                }
            }
            tag => return Err(format!("unknown value tag {tag}")),
        }
        // Position the reader on the next value, closing finished containers.
        loop {
            let Some(level) = open.last_mut() else {
                return Ok(());
            };
            if level.remaining == 0 {
                open.pop();
                continue;
            }
            level.remaining -= 1;
            if level.map {
                let len = reader.u64()?;
                reader.skip(len)?;
            }
            break;
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: u64) -> Result<&[u8], String> {
        let end = usize::try_from(n)
            .ok()
            .and_then(|n| self.pos.checked_add(n))
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| format!("truncated payload at byte {}", self.pos))?;
        let part = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(part)
    }

    fn skip(&mut self, n: u64) -> Result<(), String> {
        self.take(n).map(|_| ())
    }

    fn u32(&mut self) -> Result<u32, String> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

// ---------------------------------------------------------------------------
// JSON mapping
// ---------------------------------------------------------------------------

fn to_safe_json(value: &Value) -> Result<serde_json::Value, EncodeError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) if i.unsigned_abs() <= MAX_SAFE_INTEGER => serde_json::Value::from(*i),
        Value::Int(i) => serde_json::Value::String(i.to_string()),
        Value::UInt(u) if *u <= MAX_SAFE_INTEGER => serde_json::Value::from(*u),
        Value::UInt(u) => serde_json::Value::String(u.to_string()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| EncodeError::Incompatible {
                format: Format::Json,
                reason: format!("non-finite float {f}"),
            })?,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(STANDARD.encode(b)),
        Value::List(items) => serde_json::Value::Array(
            items.iter().map(to_safe_json).collect::<Result<_, _>>()?,
        ),
        Value::Map(m) => serde_json::Value::Object(
            m.iter()
                .map(|(k, v)| Ok((k.clone(), to_safe_json(v)?)))
                .collect::<Result<_, EncodeError>>()?,
        ),
    })
}

/// Coerce a decoded value into the shape `schema` asks for.
///
/// Restores wide integers from their string form and bytes from base64.
/// `Null` satisfies every schema.
pub fn conform(value: Value, schema: &Schema) -> Result<Value, DecodeError> {
    let mismatch = |found: &Value| DecodeError::SchemaMismatch {
        expected: schema.name().to_string(),
        found: found.kind().to_string(),
    };
    match (schema, value) {
        (_, Value::Null) => Ok(Value::Null),
        (Schema::Any, v) => Ok(v),

        (Schema::Bool, v @ Value::Bool(_)) => Ok(v),

        (Schema::Int, v @ Value::Int(_)) => Ok(v),
        (Schema::Int, Value::UInt(u)) => i64::try_from(u)
            .map(Value::Int)
            .map_err(|_| mismatch(&Value::UInt(u))),
        (Schema::Int, Value::String(s)) => s.parse::<i64>().map(Value::Int).map_err(|_| mismatch(&Value::String(s))),

        (Schema::UInt, v @ Value::UInt(_)) => Ok(v),
        (Schema::UInt, Value::Int(i)) => u64::try_from(i)
            .map(Value::UInt)
            .map_err(|_| mismatch(&Value::Int(i))),
        (Schema::UInt, Value::String(s)) => s.parse::<u64>().map(Value::UInt).map_err(|_| mismatch(&Value::String(s))),

        (Schema::Float, v @ Value::Float(_)) => Ok(v),
        (Schema::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (Schema::Float, Value::UInt(u)) => Ok(Value::Float(u as f64)),

        (Schema::String, v @ Value::String(_)) => Ok(v),

        (Schema::Bytes, v @ Value::Bytes(_)) => Ok(v),
        (Schema::Bytes, Value::String(s)) => STANDARD
            .decode(s.as_bytes())
            .map(Value::Bytes)
            .map_err(|e| DecodeError::Malformed {
                format: Format::Json,
                reason: format!("invalid base64: {e}"),
            }),

        (Schema::List(inner), Value::List(items)) => items
            .into_iter()
            .map(|v| conform(v, inner))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),

        (Schema::Map(inner), Value::Map(m)) => m
            .into_iter()
            .map(|(k, v)| Ok((k, conform(v, inner)?)))
            .collect::<Result<_, DecodeError>>()
            .map(Value::Map),

        (Schema::Struct(fields), Value::Map(m)) => m
            .into_iter()
            .map(|(k, v)| {
                let v = match fields.get(&k) {
                    Some(field) => conform(v, field)?,
                    None => v,
                };
                Ok((k, v))
            })
            .collect::<Result<_, DecodeError>>()
            .map(Value::Map),

        (_, other) => Err(mismatch(&other)),
    }
}
