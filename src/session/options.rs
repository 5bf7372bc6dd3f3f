use crate::core::{OrmError, Result};
use serde::Deserialize;

pub const ORDER_INSERTS: &str = "reactorm.order_inserts";
pub const ORDER_UPDATES: &str = "reactorm.order_updates";
pub const USE_QUERY_CACHE: &str = "reactorm.cache.use_query_cache";
pub const BATCH_SIZE: &str = "reactorm.jdbc.batch_size";

/// Settings every session of a factory shares
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionFactoryOptions {
    /// Group and order inserts by entity dependencies before a flush.
    pub order_inserts: bool,
    /// Sort updates and collection actions by entity name and key.
    pub order_updates: bool,
    /// Maintain update timestamps for query-space invalidation.
    pub query_cache_enabled: bool,
    /// Statements buffered per batch; 1 disables batching.
    pub batch_size: usize,
}

impl Default for SessionFactoryOptions {
    fn default() -> Self {
        Self {
            order_inserts: false,
            order_updates: false,
            query_cache_enabled: false,
            batch_size: 1,
        }
    }
}

impl SessionFactoryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_inserts(mut self, enabled: bool) -> Self {
        self.order_inserts = enabled;
        self
    }

    pub fn order_updates(mut self, enabled: bool) -> Self {
        self.order_updates = enabled;
        self
    }

    pub fn query_cache_enabled(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Parses options from a JSON object; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| OrmError::Config(format!("Invalid session factory options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads the `reactorm.*` keys from string properties. Unknown keys are
    /// ignored.
    pub fn from_properties<'a, I>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = Self::default();
        for (key, value) in properties {
            match key {
                ORDER_INSERTS => options.order_inserts = parse_bool(key, value)?,
                ORDER_UPDATES => options.order_updates = parse_bool(key, value)?,
                USE_QUERY_CACHE => options.query_cache_enabled = parse_bool(key, value)?,
                BATCH_SIZE => {
                    options.batch_size = value.trim().parse().map_err(|_| {
                        OrmError::Config(format!("Invalid integer for {}: '{}'", key, value))
                    })?
                }
                _ => {}
            }
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(OrmError::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(OrmError::Config(format!(
            "Invalid boolean for {}: '{}'",
            key, value
        ))),
    }
}
