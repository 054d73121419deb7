// SPDX-License-Identifier: Apache-2.0

//! Typed agent configuration, built from the parsed value tree.

pub mod value;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use value::Section;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config parse error: {0}")]
    Parse(#[from] value::ParseError),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid regex '{0}': {1}")]
    Regex(String, regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const POLL_MIN_MS: u64 = 100;
const POLL_MAX_MS: u64 = 9999;
const DEFAULT_POLL_MS: u64 = 500;
const DEFAULT_LINES: usize = 100;
const DEFAULT_LOG_WATCH_INTERVAL_S: u64 = 5;
const DEFAULT_TIMEOUT_S: u64 = 10;

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub settings: Settings,
    pub inputs: Vec<InputConfig>,
    pub outputs: Vec<OutputConfig>,
    /// Opaque logger block, interpreted by logging setup in the binary.
    pub logger: Option<Section>,
}

/// Global scalars.
#[derive(Debug, Clone)]
pub struct Settings {
    pub poll: Duration,
    pub lines: usize,
    pub benchmark: bool,
    pub hostname: String,
    pub milliseconds: bool,
    pub old_logstash_json: bool,
    pub log_watch_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(DEFAULT_POLL_MS),
            lines: DEFAULT_LINES,
            benchmark: false,
            hostname: default_hostname(),
            milliseconds: false,
            old_logstash_json: false,
            log_watch_interval: Duration::from_secs(DEFAULT_LOG_WATCH_INTERVAL_S),
        }
    }
}

fn default_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Event rendering chosen per input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFormat {
    #[default]
    Plain,
    JsonEvent,
}

/// A fixed field added to every envelope from an input.
#[derive(Debug, Clone)]
pub struct StaticField {
    pub name: String,
    pub value: String,
}

/// A field computed at encode time from a regex over another envelope field.
#[derive(Debug, Clone)]
pub struct FieldRecipe {
    pub name: String,
    /// Source key read on the envelope, typically `@source_path`.
    pub field: String,
    pub pattern: Regex,
    /// Template expanded against the captures, `$1`..`$9`.
    pub concat: String,
    pub default: Option<String>,
}

/// Options shared by every input kind.
#[derive(Debug, Clone, Default)]
pub struct InputCommon {
    pub type_label: Option<String>,
    pub tags: Vec<String>,
    pub fields: Vec<StaticField>,
    pub field_matches: Vec<FieldRecipe>,
    /// Worker count when the input requested its own process group.
    pub workers: Option<usize>,
    pub format: EventFormat,
}

#[derive(Debug, Clone)]
pub enum InputConfig {
    File(FileInputConfig),
    Socket(SocketInputConfig),
}

impl InputConfig {
    pub fn common(&self) -> &InputCommon {
        match self {
            InputConfig::File(c) => &c.common,
            InputConfig::Socket(c) => &c.common,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    Begin,
    #[default]
    End,
}

#[derive(Debug, Clone)]
pub struct FileInputConfig {
    pub common: InputCommon,
    /// Paths as written in the config; may contain `*` wildcards and
    /// comma-separated entries.
    pub paths: Vec<String>,
    pub save_position: bool,
    /// Marker file path; defaults to `<path>.pos`.
    pub position_file: Option<PathBuf>,
    pub start_position: StartPosition,
    pub skip: Vec<Regex>,
    pub grep: Vec<Regex>,
}

/// TLS material for either side of a connection. `verify` carries the raw
/// mode flags: PEER=0x01, FAIL_IF_NO_PEER_CERT=0x02, CLIENT_ONCE=0x04,
/// NONE=0x00.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub verify: u8,
}

#[derive(Debug, Clone)]
pub struct SocketInputConfig {
    pub common: InputCommon,
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsSettings>,
    pub auth: Option<String>,
    pub response: Option<String>,
}

#[derive(Debug, Clone)]
pub enum OutputConfig {
    Redis(RedisOutputConfig),
    Amqp(AmqpOutputConfig),
    Socket(SocketOutputConfig),
    Gelf(GelfOutputConfig),
    Screen(ScreenOutputConfig),
}

impl OutputConfig {
    pub fn types(&self) -> &[String] {
        match self {
            OutputConfig::Redis(c) => &c.types,
            OutputConfig::Amqp(c) => &c.types,
            OutputConfig::Socket(c) => &c.types,
            OutputConfig::Gelf(c) => &c.types,
            OutputConfig::Screen(c) => &c.types,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutputConfig::Redis(_) => "redis",
            OutputConfig::Amqp(_) => "amqp",
            OutputConfig::Socket(_) => "socket",
            OutputConfig::Gelf(_) => "gelf",
            OutputConfig::Screen(_) => "screen",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisOutputConfig {
    pub types: Vec<String>,
    pub hosts: Vec<String>,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub exclusive: bool,
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone)]
pub struct AmqpOutputConfig {
    pub types: Vec<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub exchange: ExchangeSettings,
    pub queue: QueueSettings,
    pub heartbeat: Option<u16>,
    pub frame_max: Option<u32>,
    pub channel_max: Option<u16>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SocketOutputConfig {
    pub types: Vec<String>,
    pub hosts: Vec<String>,
    pub port: u16,
    pub tls: Option<TlsSettings>,
    pub auth: Option<String>,
    pub response: Option<Regex>,
    pub persistent: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GelfOutputConfig {
    pub types: Vec<String>,
    pub host: String,
    pub port: u16,
    pub gzip: bool,
    pub facility: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScreenTarget {
    #[default]
    Stdout,
    Stderr,
    Null,
}

#[derive(Debug, Clone)]
pub struct ScreenOutputConfig {
    pub types: Vec<String>,
    pub target: ScreenTarget,
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let tree = value::parse_file(path)?;
        Self::from_tree(&tree)
    }

    pub fn from_tree(tree: &Section) -> Result<Self> {
        let settings = Settings::from_tree(tree)?;

        let mut inputs = Vec::new();
        for block in tree.sections("input") {
            for (kind, entry) in block.entries() {
                let sections = match entry {
                    value::Value::Section(s) => vec![s],
                    value::Value::List(items) => {
                        items.iter().filter_map(|v| v.as_section()).collect()
                    }
                    value::Value::Scalar(_) => {
                        return Err(Error::Invalid(format!(
                            "input '{}' is not a block",
                            kind
                        )))
                    }
                };
                for section in sections {
                    match kind.as_str() {
                        "file" => inputs.push(InputConfig::File(parse_file_input(section)?)),
                        "socket" => {
                            inputs.push(InputConfig::Socket(parse_socket_input(section)?))
                        }
                        other => {
                            return Err(Error::Invalid(format!("unknown input kind '{}'", other)))
                        }
                    }
                }
            }
        }

        let mut outputs = Vec::new();
        for block in tree.sections("output") {
            for (kind, entry) in block.entries() {
                let sections = match entry {
                    value::Value::Section(s) => vec![s],
                    value::Value::List(items) => {
                        items.iter().filter_map(|v| v.as_section()).collect()
                    }
                    value::Value::Scalar(_) => {
                        return Err(Error::Invalid(format!(
                            "output '{}' is not a block",
                            kind
                        )))
                    }
                };
                for section in sections {
                    outputs.push(match kind.as_str() {
                        "redis" => OutputConfig::Redis(parse_redis_output(section)?),
                        "amqp" => OutputConfig::Amqp(parse_amqp_output(section)?),
                        "socket" => OutputConfig::Socket(parse_socket_output(section)?),
                        "gelf" => OutputConfig::Gelf(parse_gelf_output(section)?),
                        "screen" => OutputConfig::Screen(parse_screen_output(section)?),
                        other => {
                            return Err(Error::Invalid(format!(
                                "unknown output kind '{}'",
                                other
                            )))
                        }
                    });
                }
            }
        }

        let logger = tree.sections("logger").first().map(|s| (*s).clone());

        let config = Self {
            settings,
            inputs,
            outputs,
            logger,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::Invalid("no inputs configured".to_string()));
        }
        if self.outputs.is_empty() {
            return Err(Error::Invalid("no outputs configured".to_string()));
        }
        for input in &self.inputs {
            if let Some(workers) = input.common().workers {
                if workers == 0 {
                    return Err(Error::Invalid("workers must be at least 1".to_string()));
                }
            }
            if let InputConfig::File(f) = input {
                if f.paths.is_empty() {
                    return Err(Error::Invalid("file input requires a path".to_string()));
                }
            }
        }
        for output in &self.outputs {
            if output.types().is_empty() {
                return Err(Error::Invalid(format!(
                    "{} output requires a type",
                    output.kind()
                )));
            }
        }
        Ok(())
    }
}

impl Settings {
    fn from_tree(tree: &Section) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(poll) = tree.scalar("poll") {
            let ms: u64 = poll
                .parse()
                .map_err(|_| Error::Invalid(format!("poll '{}' is not a number", poll)))?;
            let clamped = ms.clamp(POLL_MIN_MS, POLL_MAX_MS);
            if clamped != ms {
                warn!(poll = ms, clamped, "poll interval out of range, clamping");
            }
            settings.poll = Duration::from_millis(clamped);
        }
        if let Some(lines) = tree.scalar("lines") {
            settings.lines = lines
                .parse()
                .map_err(|_| Error::Invalid(format!("lines '{}' is not a number", lines)))?;
        }
        if let Some(v) = tree.scalar("benchmark") {
            settings.benchmark = parse_bool("benchmark", v)?;
        }
        if let Some(hostname) = tree.scalar("hostname") {
            settings.hostname = hostname.to_string();
        }
        if let Some(v) = tree.scalar("milliseconds") {
            settings.milliseconds = parse_bool("milliseconds", v)?;
        }
        if let Some(v) = tree.scalar("oldlogstashjson") {
            settings.old_logstash_json = parse_bool("oldlogstashjson", v)?;
        }
        if let Some(v) = tree.scalar("log_watch_interval") {
            let secs: u64 = v.parse().map_err(|_| {
                Error::Invalid(format!("log_watch_interval '{}' is not a number", v))
            })?;
            settings.log_watch_interval = Duration::from_secs(secs);
        }

        Ok(settings)
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v {
        "yes" | "1" | "true" => Ok(true),
        "no" | "0" | "false" => Ok(false),
        other => Err(Error::Invalid(format!(
            "{} must be yes|no|0|1, got '{}'",
            key, other
        ))),
    }
}

fn parse_common(section: &Section) -> Result<InputCommon> {
    let mut common = InputCommon {
        type_label: section.scalar("type").map(str::to_string),
        tags: comma_list(&section.scalars("tags")),
        ..Default::default()
    };

    for field in section.sections("field") {
        let name = require(field, "name", "field")?;
        let value = require(field, "value", "field")?;
        common.fields.push(StaticField {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    for recipe in section.sections("field_match") {
        let name = require(recipe, "name", "field_match")?;
        let pattern = require(recipe, "match", "field_match")?;
        let concat = require(recipe, "concat", "field_match")?;
        common.field_matches.push(FieldRecipe {
            name: name.to_string(),
            field: recipe
                .scalar("field")
                .unwrap_or("@source_path")
                .to_string(),
            pattern: compile(pattern)?,
            concat: concat.to_string(),
            default: recipe.scalar("default").map(str::to_string),
        });
    }

    if let Some(workers) = section.scalar("workers") {
        common.workers = Some(workers.parse().map_err(|_| {
            Error::Invalid(format!("workers '{}' is not a number", workers))
        })?);
    }

    if let Some(format) = section.scalar("format") {
        common.format = match format {
            "plain" => EventFormat::Plain,
            "json_event" => EventFormat::JsonEvent,
            other => {
                return Err(Error::Invalid(format!(
                    "format must be plain|json_event, got '{}'",
                    other
                )))
            }
        };
    }

    Ok(common)
}

fn parse_file_input(section: &Section) -> Result<FileInputConfig> {
    let common = parse_common(section)?;
    let paths = comma_list(&section.scalars("path"));
    if paths.is_empty() {
        return Err(Error::Invalid("file input requires a path".to_string()));
    }

    let save_position = match section.scalar("save_position") {
        Some(v) => parse_bool("save_position", v)?,
        None => false,
    };
    let start_position = match section.scalar("start_position") {
        Some("begin" | "beginning") => StartPosition::Begin,
        Some("end") | None => StartPosition::End,
        Some(other) => {
            return Err(Error::Invalid(format!(
                "start_position must be begin|end, got '{}'",
                other
            )))
        }
    };

    Ok(FileInputConfig {
        common,
        paths,
        save_position,
        position_file: section.scalar("position_file").map(PathBuf::from),
        start_position,
        skip: compile_all(&section.scalars("skip"))?,
        grep: compile_all(&section.scalars("grep"))?,
    })
}

fn parse_socket_input(section: &Section) -> Result<SocketInputConfig> {
    Ok(SocketInputConfig {
        common: parse_common(section)?,
        host: section.scalar("host").unwrap_or("0.0.0.0").to_string(),
        port: parse_port(section, "socket input")?,
        tls: parse_tls(section)?,
        auth: section.scalar("auth").map(str::to_string),
        response: section.scalar("response").map(str::to_string),
    })
}

fn parse_tls(section: &Section) -> Result<Option<TlsSettings>> {
    let ca_file = section.scalar("ssl_ca").map(str::to_string);
    let cert_file = section.scalar("ssl_cert").map(str::to_string);
    let key_file = section.scalar("ssl_key").map(str::to_string);
    let verify = match section.scalar("ssl_verify") {
        Some(v) => v
            .parse::<u8>()
            .map_err(|_| Error::Invalid(format!("ssl_verify '{}' is not a number", v)))?,
        None => 0,
    };
    if ca_file.is_none() && cert_file.is_none() && key_file.is_none() {
        if section.scalar("ssl_verify").is_some() {
            return Err(Error::Invalid(
                "ssl_verify given without any ssl material".to_string(),
            ));
        }
        return Ok(None);
    }
    Ok(Some(TlsSettings {
        ca_file,
        cert_file,
        key_file,
        verify,
    }))
}

fn parse_types(section: &Section, kind: &str) -> Result<Vec<String>> {
    let types = comma_list(&section.scalars("type"));
    if types.is_empty() {
        return Err(Error::Invalid(format!("{} output requires a type", kind)));
    }
    Ok(types)
}

fn parse_redis_output(section: &Section) -> Result<RedisOutputConfig> {
    Ok(RedisOutputConfig {
        types: parse_types(section, "redis")?,
        hosts: parse_hosts(section, "redis")?,
        port: parse_port_default(section, 6379)?,
        db: match section.scalar("db") {
            Some(v) => v
                .parse()
                .map_err(|_| Error::Invalid(format!("db '{}' is not a number", v)))?,
            None => 0,
        },
        password: section.scalar("password").map(str::to_string),
        key: require(section, "key", "redis output")?.to_string(),
        timeout: parse_timeout(section)?,
    })
}

fn parse_amqp_output(section: &Section) -> Result<AmqpOutputConfig> {
    let exchange = ExchangeSettings {
        name: require(section, "exchange", "amqp output")?.to_string(),
        kind: section
            .scalar("exchange_type")
            .unwrap_or("direct")
            .to_string(),
        durable: opt_bool(section, "exchange_durable")?.unwrap_or(false),
        auto_delete: opt_bool(section, "exchange_auto_delete")?.unwrap_or(false),
    };
    let queue = QueueSettings {
        name: require(section, "queue", "amqp output")?.to_string(),
        exclusive: opt_bool(section, "queue_exclusive")?.unwrap_or(false),
        durable: opt_bool(section, "queue_durable")?.unwrap_or(false),
        auto_delete: opt_bool(section, "queue_auto_delete")?.unwrap_or(false),
    };

    Ok(AmqpOutputConfig {
        types: parse_types(section, "amqp")?,
        host: require(section, "host", "amqp output")?.to_string(),
        port: parse_port_default(section, 5672)?,
        user: section.scalar("user").unwrap_or("guest").to_string(),
        password: section.scalar("password").unwrap_or("guest").to_string(),
        vhost: section.scalar("vhost").unwrap_or("/").to_string(),
        exchange,
        queue,
        heartbeat: opt_num(section, "heartbeat")?,
        frame_max: opt_num(section, "frame_max")?,
        channel_max: opt_num(section, "channel_max")?,
        timeout: parse_timeout(section)?,
    })
}

fn parse_socket_output(section: &Section) -> Result<SocketOutputConfig> {
    Ok(SocketOutputConfig {
        types: parse_types(section, "socket")?,
        hosts: parse_hosts(section, "socket")?,
        port: parse_port(section, "socket output")?,
        tls: parse_tls(section)?,
        auth: section.scalar("auth").map(str::to_string),
        response: match section.scalar("response") {
            Some(pattern) => Some(compile(pattern)?),
            None => None,
        },
        persistent: opt_bool(section, "persistent")?.unwrap_or(true),
        timeout: parse_timeout(section)?,
    })
}

fn parse_gelf_output(section: &Section) -> Result<GelfOutputConfig> {
    Ok(GelfOutputConfig {
        types: parse_types(section, "gelf")?,
        host: require(section, "host", "gelf output")?.to_string(),
        port: parse_port_default(section, 12201)?,
        gzip: opt_bool(section, "gzip")?.unwrap_or(true),
        facility: section.scalar("facility").unwrap_or("skidder").to_string(),
    })
}

fn parse_screen_output(section: &Section) -> Result<ScreenOutputConfig> {
    let target = match section.scalar("target") {
        Some("stdout") | None => ScreenTarget::Stdout,
        Some("stderr") => ScreenTarget::Stderr,
        Some("null") | Some("none") => ScreenTarget::Null,
        Some(other) => {
            return Err(Error::Invalid(format!(
                "screen target must be stdout|stderr|null, got '{}'",
                other
            )))
        }
    };
    Ok(ScreenOutputConfig {
        types: parse_types(section, "screen")?,
        target,
    })
}

fn parse_hosts(section: &Section, kind: &str) -> Result<Vec<String>> {
    let hosts = comma_list(&section.scalars("host"));
    if hosts.is_empty() {
        return Err(Error::Invalid(format!("{} output requires a host", kind)));
    }
    Ok(hosts)
}

fn parse_port(section: &Section, what: &str) -> Result<u16> {
    match section.scalar("port") {
        Some(v) => v
            .parse()
            .map_err(|_| Error::Invalid(format!("port '{}' is not a number", v))),
        None => Err(Error::Invalid(format!("{} requires a port", what))),
    }
}

fn parse_port_default(section: &Section, default: u16) -> Result<u16> {
    match section.scalar("port") {
        Some(v) => v
            .parse()
            .map_err(|_| Error::Invalid(format!("port '{}' is not a number", v))),
        None => Ok(default),
    }
}

fn parse_timeout(section: &Section) -> Result<Duration> {
    match section.scalar("timeout") {
        Some(v) => {
            let secs: u64 = v
                .parse()
                .map_err(|_| Error::Invalid(format!("timeout '{}' is not a number", v)))?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(DEFAULT_TIMEOUT_S)),
    }
}

fn opt_bool(section: &Section, key: &str) -> Result<Option<bool>> {
    match section.scalar(key) {
        Some(v) => Ok(Some(parse_bool(key, v)?)),
        None => Ok(None),
    }
}

fn opt_num<T: std::str::FromStr>(section: &Section, key: &str) -> Result<Option<T>> {
    match section.scalar(key) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| Error::Invalid(format!("{} '{}' is not a number", key, v))),
        None => Ok(None),
    }
}

fn require<'a>(section: &'a Section, key: &str, what: &str) -> Result<&'a str> {
    section
        .scalar(key)
        .ok_or_else(|| Error::Invalid(format!("{} requires '{}'", what, key)))
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Regex(pattern.to_string(), e))
}

fn compile_all(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile(p)).collect()
}

/// Split scalar occurrences on commas and trim, dropping empty entries.
fn comma_list(values: &[&str]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
