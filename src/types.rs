//! Identifiers, principals and timestamps shared by every module
use crate::utils::new_uuid_to_bech32;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl Copy for TimeStamp<Utc> {}

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    /// `None` when the sum leaves chrono's representable range.
    pub fn checked_plus(&self, duration: Duration) -> Option<Self> {
        self.0.checked_add_signed(duration).map(Self)
    }
    /// Whether the CBOR codec can store this instant (nanoseconds in an i64).
    pub fn is_encodable(&self) -> bool {
        self.0.timestamp_nanos_opt().is_some()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Source of "now" for lazy expiry and audit timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::new()
    }
}

/// A clock that only moves when told to. Used to exercise expiry deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<TimeStamp<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: TimeStamp<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(later) = now.checked_plus(by) {
            *now = later;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

macro_rules! bech32_id {
    ($(#[$doc:meta])* $name:ident, $hrp:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
        )]
        pub struct $name(#[n(0)] String);

        impl $name {
            pub const HRP: &'static str = $hrp;

            pub fn generate() -> anyhow::Result<Self> {
                Ok(Self(new_uuid_to_bech32(Self::HRP)?))
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

bech32_id!(RequestId, "req");
bech32_id!(EstimateId, "est");
bech32_id!(ClientId, "client");
bech32_id!(ArtisanId, "artisan");
bech32_id!(AdminId, "admin");
bech32_id!(
    /// Opaque token handed to an anonymous submitter; exchangeable for an account later.
    GuestToken,
    "guest"
);

/// The resolved identity behind a call.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Principal {
    #[n(0)]
    Client(#[n(0)] ClientId),
    #[n(1)]
    Artisan(#[n(0)] ArtisanId),
    #[n(2)]
    Admin(#[n(0)] AdminId),
    #[n(3)]
    Guest(#[n(0)] GuestToken),
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin(_))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(id) => write!(f, "client {id}"),
            Self::Artisan(id) => write!(f, "artisan {id}"),
            Self::Admin(id) => write!(f, "admin {id}"),
            Self::Guest(_) => f.write_str("guest"),
        }
    }
}

/// Who owns a request. A sum type, so a request can never have both or neither.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Owner {
    #[n(0)]
    Client(#[n(0)] ClientId),
    #[n(1)]
    Guest(#[n(0)] GuestToken),
}

impl Owner {
    /// The owner a submitting principal becomes, if it may own requests at all.
    pub fn from_principal(principal: &Principal) -> Option<Self> {
        match principal {
            Principal::Client(id) => Some(Self::Client(id.clone())),
            Principal::Guest(token) => Some(Self::Guest(token.clone())),
            Principal::Artisan(_) | Principal::Admin(_) => None,
        }
    }
    pub fn is(&self, principal: &Principal) -> bool {
        match (self, principal) {
            (Self::Client(owner), Principal::Client(caller)) => owner == caller,
            (Self::Guest(owner), Principal::Guest(caller)) => owner == caller,
            _ => false,
        }
    }
}

/// The two parties whose consent the workflow tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum Side {
    #[n(0)]
    Client,
    #[n(1)]
    Artisan,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Self::Client => Self::Artisan,
            Self::Artisan => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Artisan => f.write_str("artisan"),
        }
    }
}
