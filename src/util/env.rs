//! Process configuration.
//!
//! Values come from the process environment (plus a `.env` file, via [`dotenvy`]) and are
//! deserialized into [`Env`] by a small serde deserializer over `(NAME, value)` pairs, in the
//! spirit of the [`envy`] crate. Scalars are parsed on demand so that typed fields (`u64`,
//! `i64`, enums, ...) work without any intermediate representation.
//!
//! [`envy`]: https://github.com/softprops/envy

use std::sync::LazyLock;

use serde::de::value::MapDeserializer;
use serde::de::{self, IntoDeserializer};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;

static ENV_VARS: LazyLock<OnceCell<Env>> = LazyLock::new(OnceCell::new);

/// Returns the process-wide configuration, loading it on first use.
pub async fn env() -> EnvResult<&'static Env> {
    ENV_VARS.get_or_try_init(|| async { Env::new() }).await
}

/// Borrow a single field from the loaded [`Env`], e.g. `var!(redis_url)?`.
#[macro_export]
macro_rules! var {
    ($field:ident) => {
        $crate::util::env::env().await.map(|env| &env.$field)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordMode {
    /// Scored events are appended to the score stream and persisted by the batch consumer.
    Queue,
    /// Scored events are written to postgres inline.
    Direct,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Env {
    pub database_url: String,
    pub redis_url: String,
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_ingest_stream")]
    pub ingest_stream: String,
    #[serde(default = "default_score_stream")]
    pub score_stream: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    #[serde(default = "default_record_mode")]
    pub record_mode: RecordMode,

    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_secs: i64,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: i64,
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,
    #[serde(default = "default_ack_wait")]
    pub ack_wait_secs: u64,

    #[serde(default = "default_persist_timeout")]
    pub persist_timeout_secs: u64,
    #[serde(default = "default_persist_max_retries")]
    pub persist_max_retries: u32,
    #[serde(default = "default_persist_retry_delay")]
    pub persist_retry_delay_ms: u64,

    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_processed_ttl")]
    pub processed_ttl_secs: u64,
    #[serde(default = "default_store_op_timeout")]
    pub store_op_timeout_ms: u64,

    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// JSON object overriding the built-in scoring table.
    pub scoring_table: Option<String>,
}

impl Env {
    pub fn new() -> EnvResult<Self> {
        Ok(from_iter(dotenvy::vars())?)
    }

    /// Cross-field constraints a single variable can't express.
    ///
    /// A nak'd message waits out the event lock before redelivery, which needs the ack wait
    /// to outlast the lock.
    pub fn check(&self) -> EnvResult<()> {
        if self.ack_wait_secs <= self.lock_ttl_secs {
            return Err(EnvErr::Invalid(format!(
                "ACK_WAIT_SECS ({}) must be greater than LOCK_TTL_SECS ({})",
                self.ack_wait_secs, self.lock_ttl_secs
            )));
        }
        Ok(())
    }
}

fn default_service_name() -> String {
    String::from("contrib-leaderboard")
}

fn default_ingest_stream() -> String {
    String::from("contribution-events")
}

fn default_score_stream() -> String {
    String::from("score-events")
}

fn default_consumer_group() -> String {
    String::from("leaderboard")
}

fn default_consumer_name() -> String {
    String::from("leaderboard-0")
}

#[inline]
const fn default_record_mode() -> RecordMode {
    RecordMode::Queue
}

#[inline]
const fn default_fetch_interval() -> i64 {
    20
}

#[inline]
const fn default_metrics_interval() -> i64 {
    30
}

#[inline]
const fn default_fetch_batch_size() -> usize {
    100
}

#[inline]
const fn default_ack_wait() -> u64 {
    60
}

#[inline]
const fn default_persist_timeout() -> u64 {
    30
}

#[inline]
const fn default_persist_max_retries() -> u32 {
    3
}

#[inline]
const fn default_persist_retry_delay() -> u64 {
    500
}

#[inline]
const fn default_lock_ttl() -> u64 {
    30
}

#[inline]
const fn default_processed_ttl() -> u64 {
    7 * 24 * 60 * 60
}

#[inline]
const fn default_store_op_timeout() -> u64 {
    2000
}

#[inline]
const fn default_snapshot_interval() -> u64 {
    60 * 60
}

#[inline]
const fn default_snapshot_timeout() -> u64 {
    300
}

#[inline]
const fn default_shutdown_grace() -> u64 {
    15
}

// ---
//  Deserializer implementation
// ---

/// A single environment value, tagged with the variable it came from for error messages.
struct Val {
    name: String,
    value: String,
}

struct Varname(String);

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Val {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Varname {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

macro_rules! parse_scalar {
    ($($ty:ident => $method:ident,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, EnvDeserializeError>
            where
                V: de::Visitor<'de>,
            {
                let parsed = self.value.trim().parse::<$ty>().map_err(|e| {
                    EnvDeserializeError::Custom(format!(
                        "{}: invalid value '{}' ({})",
                        self.name, self.value, e
                    ))
                })?;
                parsed.into_deserializer().$method(visitor)
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for Val {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.value.into_deserializer().deserialize_any(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.value.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_enum(self.value.to_lowercase().into_deserializer())
    }

    fn deserialize_newtype_struct<V>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    parse_scalar! {
        bool => deserialize_bool,
        u16 => deserialize_u16,
        u32 => deserialize_u32,
        u64 => deserialize_u64,
        i32 => deserialize_i32,
        i64 => deserialize_i64,
    }

    serde::forward_to_deserialize_any! {
        u8 i8 i16 f32 f64 char str string unit seq bytes byte_buf map
        unit_struct tuple_struct identifier tuple ignored_any struct
    }
}

impl<'de> de::Deserializer<'de> for Varname {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.0.into_deserializer().deserialize_any(visitor)
    }

    serde::forward_to_deserialize_any! {
        bool u8 u16 u32 u64 i8 i16 i32 i64 f32 f64 char str string unit seq option
        bytes byte_buf map unit_struct newtype_struct tuple_struct identifier tuple
        ignored_any enum struct
    }
}

/// Deserialize `T` from `(NAME, value)` pairs; unknown names are ignored by the target type.
pub fn from_iter<Iter, T>(iter: Iter) -> Result<T, EnvDeserializeError>
where
    T: de::DeserializeOwned,
    Iter: IntoIterator<Item = (String, String)>,
{
    let pairs = iter
        .into_iter()
        .map(|(name, value)| (Varname(name.clone()), Val { name, value }));

    let mut map = MapDeserializer::new(pairs);
    let value = T::deserialize(de::value::MapAccessDeserializer::new(&mut map))?;
    map.end()?;

    Ok(value)
}

impl de::Error for EnvDeserializeError {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        EnvDeserializeError::Custom(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        EnvDeserializeError::MissingValue(field.to_uppercase())
    }
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error(transparent)]
    Dotenvy(#[from] dotenvy::Error),

    #[error(transparent)]
    DeserializationError(#[from] EnvDeserializeError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("missing required variable {0}")]
    MissingValue(String),
}
