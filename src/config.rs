use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub compiler: CompilerConfig,
    pub logging: LoggingConfig,
}

/// Limits and defaults applied while compiling a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Upper bound for generated table and column identifiers
    pub max_identifier_length: usize,
    /// Upper bound for a single normalized path segment
    pub max_segment_length: usize,
    pub default_string_length: u32,
    pub default_binary_length: u32,
    pub default_srid: u32,
    pub default_decimal_precision: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_identifier_length: 127,
            max_segment_length: 32,
            default_string_length: 5000,
            default_binary_length: 5000,
            default_srid: 4326,
            default_decimal_precision: 34,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional `docrel` config file and
    /// `DOCREL_` prefixed environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        config = config.add_source(config::File::with_name("docrel").required(false));

        // DOCREL_COMPILER__MAX_IDENTIFIER_LENGTH=64
        config = config.add_source(
            config::Environment::with_prefix("DOCREL")
                .separator("__")
                .prefix_separator("_")
                .try_parsing(true),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }
}
