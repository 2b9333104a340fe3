//! Serde helpers for protojson encodings.

/// 64-bit integers travel as JSON strings in protojson. Accept both forms on
/// input, always emit strings.
pub mod int64_string {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S>(value: &i64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(Int64Visitor)
    }

    struct Int64Visitor;

    impl<'de> Visitor<'de> for Int64Visitor {
        type Value = i64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an integer or a decimal string")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
            i64::try_from(v).map_err(|_| E::custom(format!("integer out of range: {}", v)))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
            v.trim()
                .parse::<i64>()
                .map_err(|e| E::custom(format!("invalid int64 '{}': {}", v, e)))
        }
    }
}

/// `Vec<i64>` in protojson form (`["1", "2"]`).
pub mod int64_string_vec {
    use serde::de::Deserializer;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Serializer};

    #[derive(Deserialize)]
    struct Wrapped(#[serde(with = "super::int64_string")] i64);

    pub fn serialize<S>(values: &[i64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&value.to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wrapped = Vec::<Wrapped>::deserialize(deserializer)?;
        Ok(wrapped.into_iter().map(|w| w.0).collect())
    }
}

/// `google.protobuf.Duration` in protojson form (`"1.500s"`), held as
/// whole microseconds.
pub mod duration_micros {
    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};

    pub fn serialize<S>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(micros) => serializer.serialize_str(&format_micros(*micros)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(raw) => parse_micros(&raw).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }

    pub fn parse_micros(raw: &str) -> Result<i64, String> {
        let body = raw
            .strip_suffix('s')
            .ok_or_else(|| format!("duration '{}' missing 's' suffix", raw))?;
        let (negative, body) = match body.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, body),
        };
        let (secs, frac) = body.split_once('.').unwrap_or((body, ""));
        let secs: i64 = secs
            .parse()
            .map_err(|e| format!("invalid duration '{}': {}", raw, e))?;
        if frac.len() > 9 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid duration fraction in '{}'", raw));
        }
        // Nanosecond precision on the wire, microseconds kept.
        let mut padded = frac.to_string();
        while padded.len() < 6 {
            padded.push('0');
        }
        let micros_frac: i64 = padded[..6]
            .parse()
            .map_err(|e| format!("invalid duration '{}': {}", raw, e))?;
        let total = secs
            .checked_mul(1_000_000)
            .and_then(|v| v.checked_add(micros_frac))
            .ok_or_else(|| format!("duration '{}' out of range", raw))?;
        Ok(if negative { -total } else { total })
    }

    pub fn format_micros(micros: i64) -> String {
        let sign = if micros < 0 { "-" } else { "" };
        let abs = micros.unsigned_abs();
        format!("{}{}.{:06}s", sign, abs / 1_000_000, abs % 1_000_000)
    }
}
