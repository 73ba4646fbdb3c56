//! Structured logging and diagnostics for trainload
//!
//! Stdout logging in pretty, json or compact form, optional JSON log files,
//! and diagnostic reports that capture an athlete's state when an invariant
//! breaks.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::{
    fmt::{layer, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    registry::LookupSpan,
    EnvFilter, Layer,
};

/// Logging configuration, `[logging]` in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level for the `trainload` target
    pub level: LogLevel,

    pub format: LogFormat,

    /// Extra filter directives, e.g. `trainload::aggregate=trace`
    pub directives: Vec<String>,

    /// JSON log file; stdout only when unset
    pub file_path: Option<PathBuf>,

    /// Start a new file every day instead of appending to one
    pub rotation: bool,

    /// Log span enter/close events
    pub include_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            directives: Vec::new(),
            file_path: None,
            rotation: true,
            include_spans: false,
        }
    }
}

impl LogConfig {
    /// Filter built from the level and extra directives
    pub fn filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::new(format!("trainload={}", self.level));
        for directive in &self.directives {
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid log directive '{}': {}", directive, e))?,
            );
        }
        Ok(filter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug, LogLevel::Trace]
            .into_iter()
            .find(|level| s.eq_ignore_ascii_case(&level.to_string()))
            .or_else(|| s.eq_ignore_ascii_case("warning").then_some(LogLevel::Warn))
            .ok_or_else(|| format!("Invalid log level: {}", s))
    }
}

/// Stdout format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Coloured multi-field lines for terminals
    Pretty,
    /// One JSON object per event, for log shippers
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("Invalid log format: {}", other)),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` replaces the configured filter.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.filter()?,
    };

    let spans = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let stdout = match config.format {
        LogFormat::Pretty => layer().with_target(true).with_span_events(spans).boxed(),
        LogFormat::Json => layer()
            .json()
            .with_current_span(config.include_spans)
            .with_span_list(config.include_spans)
            .boxed(),
        LogFormat::Compact => layer().compact().with_target(false).boxed(),
    };

    let file = match &config.file_path {
        Some(path) => Some(file_layer(path, config)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .try_init()?;

    tracing::debug!(
        level = %config.level,
        format = ?config.format,
        file = ?config.file_path,
        "Logging initialized"
    );
    Ok(())
}

fn file_layer<S>(path: &Path, config: &LogConfig) -> anyhow::Result<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let json = if config.rotation {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("trainload.log");
        layer()
            .json()
            .with_writer(tracing_appender::rolling::daily(dir, name))
            .with_current_span(config.include_spans)
            .boxed()
    } else {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        layer()
            .json()
            .with_writer(std::sync::Mutex::new(file))
            .with_current_span(config.include_spans)
            .boxed()
    };
    Ok(json)
}

/// Athlete state captured when an operation hits a broken invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub created_at: DateTime<Utc>,

    pub operation: String,

    pub athlete_id: Option<String>,

    /// Evaluation date of the failed operation
    pub as_of: Option<NaiveDate>,

    pub elapsed_ms: u64,

    pub errors: Vec<ReportedError>,

    pub context: BTreeMap<String, String>,

    /// Serialized athlete snapshot from before the operation
    pub state: Option<serde_json::Value>,

    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedError {
    pub message: String,
    /// Chain of `source()` messages, outermost first
    pub causes: Vec<String>,
}

impl DiagnosticReport {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            operation: operation.into(),
            athlete_id: None,
            as_of: None,
            elapsed_ms: 0,
            errors: Vec::new(),
            context: BTreeMap::new(),
            state: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn for_athlete(mut self, athlete_id: impl Into<String>) -> Self {
        self.athlete_id = Some(athlete_id.into());
        self
    }

    pub fn set_as_of(&mut self, as_of: NaiveDate) {
        self.as_of = Some(as_of);
    }

    pub fn set_duration(&mut self, elapsed: Duration) {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }

    pub fn add_error(&mut self, error: &(dyn std::error::Error + 'static)) {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        self.errors.push(ReportedError {
            message: error.to_string(),
            causes,
        });
    }

    pub fn add_context(&mut self, key: impl Into<String>, value: impl ToString) {
        self.context.insert(key.into(), value.to_string());
    }

    /// Attach a state snapshot. Unserializable state is noted in the context.
    pub fn capture_state<T: Serialize>(&mut self, state: &T) {
        match serde_json::to_value(state) {
            Ok(value) => self.state = Some(value),
            Err(e) => self.add_context("state_error", e),
        }
    }

    /// Emit the report at error level
    pub fn log(&self) {
        let state = self
            .state
            .as_ref()
            .map(serde_json::Value::to_string)
            .unwrap_or_default();
        tracing::error!(
            operation = %self.operation,
            athlete_id = ?self.athlete_id,
            as_of = ?self.as_of,
            elapsed_ms = self.elapsed_ms,
            errors = ?self.errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
            context = ?self.context,
            %state,
            "Diagnostic report"
        );
    }

    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        tracing::info!(path = %path.display(), "Diagnostic report saved");
        Ok(())
    }

    /// Save as `<data dir>/trainload/diagnostics/<athlete>_<operation>_<time>.json`
    pub fn save_default(&self) -> anyhow::Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trainload")
            .join("diagnostics");
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!(
            "{}_{}_{}.json",
            self.athlete_id.as_deref().unwrap_or("engine"),
            self.operation.replace(' ', "_"),
            self.created_at.format("%Y%m%dT%H%M%S")
        ));
        self.save_to_file(&path)?;
        Ok(path)
    }
}
