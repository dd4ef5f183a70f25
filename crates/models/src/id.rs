use std::str::FromStr;

// Alert epoch is the first representable timestamp in generated IDs.
// Subtracting it keeps the high bit of generated ids clear for several
// decades, so every id round-trips through a signed 64-bit database column.
const ALERT_EPOCH_MILLIS: u64 = 1_600_000_000_000;

const SEQ_BITS: u32 = 13;
const SHARD_BITS: u32 = 10;

/// Id is a 64-bit identifier of an alert, composed of a millisecond
/// timestamp, a sequence number, and the shard of the generator which minted it.
/// It's rendered as 16 hex digits.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Constructs an `Id` from its parts, or panics if a part is out of range.
    pub fn from_parts(timestamp: u64, seq: u16, shard: u16) -> Self {
        assert!(u32::from(seq) < (1 << SEQ_BITS), "sequence number out of range");
        assert!(u32::from(shard) < (1 << SHARD_BITS), "shard id out of range");
        Self(timestamp << (SEQ_BITS + SHARD_BITS) | (seq as u64) << SHARD_BITS | shard as u64)
    }

    /// Returns a tuple of (timestamp, sequence number, shard id).
    pub fn into_parts(self) -> (u64, u16, u16) {
        let timestamp = self.0 >> (SEQ_BITS + SHARD_BITS);
        let seq = ((self.0 >> SHARD_BITS) & ((1 << SEQ_BITS) - 1)) as u16;
        let shard = (self.0 & ((1 << SHARD_BITS) - 1)) as u16;
        (timestamp, seq, shard)
    }

    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }
}

impl FromStr for Id {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(&s.replace(':', ""), 16).map(Self)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let s = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Id::from_str(&s).map_err(|err| D::Error::custom(format!("invalid id: {err}")))
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Type<sqlx::Sqlite> for Id {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

#[cfg(feature = "sqlx-support")]
impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for Id {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> sqlx::encode::IsNull {
        <i64 as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&self.as_i64(), buf)
    }
}

#[cfg(feature = "sqlx-support")]
impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for Id {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        <i64 as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value).map(Self::from_i64)
    }
}

/// Generates unique, roughly time-ordered alert ids.
/// Each concurrently running generator must use a distinct shard.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    shard: u16,
    seq: u16,
    last_timestamp: u64,
}

impl IdGenerator {
    pub fn new(shard: u16) -> Self {
        Self {
            shard,
            seq: 0,
            last_timestamp: 0,
        }
    }

    pub fn next(&mut self) -> Id {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        // System time may step backwards, but generated ids must not.
        let timestamp = now.saturating_sub(ALERT_EPOCH_MILLIS).max(self.last_timestamp);

        if timestamp == self.last_timestamp {
            if u32::from(self.seq) >= (1 << SEQ_BITS) - 1 {
                // Sequence exhausted: borrow the next millisecond.
                self.last_timestamp += 1;
                self.seq = 0;
            } else {
                self.seq += 1;
            }
        } else {
            self.last_timestamp = timestamp;
            self.seq = 0;
        }
        Id::from_parts(self.last_timestamp, self.seq, self.shard)
    }
}
