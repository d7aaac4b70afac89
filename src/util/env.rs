//! Environment configuration.
//!
//! Variables are read through `dotenvy` and fed to serde via a small deserializer in the style
//! of the [`envy`] crate: numbers and bools are parsed from their string form, comma-separated
//! values deserialize into sequences and absent keys fall back to the field's serde default.
//!
//! [`envy`]: https://github.com/softprops/envy

use std::sync::LazyLock;

use serde::Deserialize;
use serde::de::value::{MapDeserializer, SeqDeserializer};
use serde::de::{self, IntoDeserializer};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::constants::*;

static ENV: LazyLock<OnceCell<Env>> = LazyLock::new(OnceCell::new);
pub async fn env() -> EnvResult<&'static Env> {
    ENV.get_or_try_init(|| async { Env::new() }).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Env {
    #[serde(default = "default_port")]
    pub server_api_port: u16,
    #[serde(default = "default_backend")]
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    #[serde(default = "default_cors")]
    pub cors_allow_origins: String,

    pub internal_token: String,
    pub identity_secret: String,
    pub draw_secret: String,

    #[serde(default)]
    pub headline_ids: Vec<String>,
    #[serde(default = "default_dynamic_cap")]
    pub dynamic_daily_cap: i64,
    #[serde(default = "default_conversion_cap")]
    pub conversion_daily_cap: i64,
    #[serde(default = "default_points_per_key")]
    pub points_per_key: i64,
    #[serde(default = "default_ticket_threshold")]
    pub ticket_threshold: i64,
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_open_lead")]
    pub open_lead_secs: i64,
    #[serde(default = "default_catchup")]
    pub max_catchup_days: i64,

    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub api_service_name: String,
    #[serde(default = "default_tracer_name")]
    pub api_tracer_name: String,
}

impl Env {
    pub fn new() -> EnvResult<Self> {
        Ok(from_iter(dotenvy::vars())?)
    }
}

fn default_port() -> u16 {
    SERVER_PORT
}
fn default_backend() -> StoreBackend {
    StoreBackend::Postgres
}
fn default_cors() -> String {
    String::from("*")
}
fn default_dynamic_cap() -> i64 {
    DEFAULT_DYNAMIC_DAILY_CAP
}
fn default_conversion_cap() -> i64 {
    DEFAULT_CONVERSION_DAILY_CAP
}
fn default_points_per_key() -> i64 {
    DEFAULT_POINTS_PER_KEY
}
fn default_ticket_threshold() -> i64 {
    DEFAULT_TICKET_THRESHOLD
}
fn default_store_timeout() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}
fn default_open_lead() -> i64 {
    DEFAULT_OPEN_LEAD_SECS
}
fn default_catchup() -> i64 {
    DEFAULT_MAX_CATCHUP_DAYS
}
fn default_service_name() -> String {
    String::from(SERVICE_NAME)
}
fn default_tracer_name() -> String {
    String::from(TRACER_NAME)
}

// ---
//  Deserializer implementation
// ---

/// A single variable's raw value, tagged with its name for error messages
struct Val {
    name: String,
    raw: String,
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Val {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

macro_rules! forward_parsed_vals {
    ($($ty:ident => $method:ident,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, EnvDeserializeError>
            where
                V: de::Visitor<'de>
            {
                match self.raw.trim().parse::<$ty>() {
                    Ok(val) => val.into_deserializer().$method(visitor),
                    Err(e) => Err(de::Error::custom(format_args!(
                        "{}: while parsing '{}' (variable: {})",
                        e, self.raw, self.name
                    )))
                }
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
        self.raw.into_deserializer().deserialize_any(visitor)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        let name = self.name;
        let values = self
            .raw
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Val {
                name: name.clone(),
                raw: v.to_owned(),
            })
            .collect::<Vec<_>>();

        SeqDeserializer::new(values.into_iter()).deserialize_seq(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.raw.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
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

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_enum(self.raw.trim().to_lowercase().into_deserializer())
    }

    forward_parsed_vals! {
        bool => deserialize_bool,
        u8 => deserialize_u8,
        u16 => deserialize_u16,
        u32 => deserialize_u32,
        u64 => deserialize_u64,
        i8 => deserialize_i8,
        i16 => deserialize_i16,
        i32 => deserialize_i32,
        i64 => deserialize_i64,
        f32 => deserialize_f32,
        f64 => deserialize_f64,
    }

    serde::forward_to_deserialize_any! {
        char str string unit bytes byte_buf map
        unit_struct tuple_struct identifier tuple
        ignored_any struct
    }
}

pub fn from_iter<Iter, T>(iter: Iter) -> Result<T, EnvDeserializeError>
where
    T: serde::de::DeserializeOwned,
    Iter: IntoIterator<Item = (String, String)>,
{
    let vars = iter.into_iter().map(|(name, raw)| {
        let val = Val {
            name: name.clone(),
            raw,
        };
        (name, val)
    });

    T::deserialize(MapDeserializer::new(vars))
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
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("missing environment variable {0}")]
    MissingValue(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_defaults_and_parsing() {
        let env: Env = from_iter(vars(&[
            ("INTERNAL_TOKEN", "internal"),
            ("IDENTITY_SECRET", "ident"),
            ("DRAW_SECRET", "draw"),
            ("STORE_BACKEND", "Memory"),
            ("DYNAMIC_DAILY_CAP", "150"),
            ("HEADLINE_IDS", "hl-a, hl-b,,hl-c"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();

        assert_eq!(env.store_backend, StoreBackend::Memory);
        assert_eq!(env.dynamic_daily_cap, 150);
        assert_eq!(env.conversion_daily_cap, DEFAULT_CONVERSION_DAILY_CAP);
        assert_eq!(env.headline_ids, vec!["hl-a", "hl-b", "hl-c"]);
        assert_eq!(env.server_api_port, SERVER_PORT);
        assert!(env.database_url.is_none());
        assert!(env.otel_exporter_otlp_endpoint.is_none());
    }

    #[test]
    fn test_env_missing_and_malformed() {
        let missing = from_iter::<_, Env>(vars(&[("INTERNAL_TOKEN", "x")]));
        assert!(matches!(missing, Err(EnvDeserializeError::MissingValue(_))));

        let malformed = from_iter::<_, Env>(vars(&[
            ("INTERNAL_TOKEN", "internal"),
            ("IDENTITY_SECRET", "ident"),
            ("DRAW_SECRET", "draw"),
            ("TICKET_THRESHOLD", "lots"),
        ]));
        assert!(matches!(malformed, Err(EnvDeserializeError::Custom(_))));
    }
}
