// SPDX-License-Identifier: Apache-2.0

//! Event envelope encoding.
//!
//! Every raw line becomes a JSON envelope carrying `@timestamp`, `@source`,
//! `@source_host`, `@source_path`, `@type`, `@fields`, `@tags` and
//! `@message`. Inputs configured as `json_event` already carry a JSON object;
//! their `@type` and `@tags` are merged with the input's and static fields
//! overlay the top level.

use chrono::{DateTime, Local};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::{EventFormat, FieldRecipe, InputCommon, Settings, StaticField};

/// An encoded event: the routing type it finally carries, plus the rendered
/// JSON payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub type_label: Option<String>,
    pub payload: String,
}

/// Per-input envelope encoder. Construction captures everything immutable
/// about the input; `encode` never blocks.
#[derive(Debug, Clone)]
pub struct Encoder {
    type_label: Option<String>,
    tags: Vec<String>,
    fields: Vec<StaticField>,
    recipes: Vec<FieldRecipe>,
    format: EventFormat,
    hostname: String,
    source: String,
    source_path: String,
    milliseconds: bool,
    flatten_fields: bool,
}

impl Encoder {
    pub fn new(settings: &Settings, common: &InputCommon, source_path: &str) -> Self {
        let source = if source_path.starts_with('/') {
            format!("file://{}{}", settings.hostname, source_path)
        } else {
            source_path.to_string()
        };
        Self {
            type_label: common.type_label.clone(),
            tags: common.tags.clone(),
            fields: common.fields.clone(),
            recipes: common.field_matches.clone(),
            format: common.format,
            hostname: settings.hostname.clone(),
            source,
            source_path: source_path.to_string(),
            milliseconds: settings.milliseconds,
            flatten_fields: settings.old_logstash_json,
        }
    }

    /// Encode one raw line. Returns `None` when a `json_event` line fails to
    /// parse as a JSON object; the line is logged and dropped.
    pub fn encode(&self, line: &str) -> Option<Event> {
        let mut envelope = match self.format {
            EventFormat::Plain => self.plain_envelope(line),
            EventFormat::JsonEvent => self.json_event_envelope(line)?,
        };

        self.apply_recipes(&mut envelope);

        let type_label = envelope
            .get("@type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let payload = Value::Object(envelope).to_string();
        Some(Event {
            type_label,
            payload,
        })
    }

    fn plain_envelope(&self, line: &str) -> Map<String, Value> {
        let mut envelope = Map::new();
        envelope.insert(
            "@timestamp".to_string(),
            Value::String(format_timestamp(Local::now(), self.milliseconds)),
        );
        envelope.insert("@source".to_string(), Value::String(self.source.clone()));
        envelope.insert(
            "@source_host".to_string(),
            Value::String(self.hostname.clone()),
        );
        envelope.insert(
            "@source_path".to_string(),
            Value::String(self.source_path.clone()),
        );
        if let Some(t) = &self.type_label {
            envelope.insert("@type".to_string(), Value::String(t.clone()));
        }
        envelope.insert(
            "@tags".to_string(),
            Value::Array(self.tags.iter().cloned().map(Value::String).collect()),
        );
        if !self.flatten_fields {
            let fields: Map<String, Value> = self
                .fields
                .iter()
                .map(|f| (f.name.clone(), Value::String(f.value.clone())))
                .collect();
            envelope.insert("@fields".to_string(), Value::Object(fields));
        } else {
            for f in &self.fields {
                envelope.insert(f.name.clone(), Value::String(f.value.clone()));
            }
        }
        envelope.insert("@message".to_string(), Value::String(line.to_string()));
        envelope
    }

    fn json_event_envelope(&self, line: &str) -> Option<Map<String, Value>> {
        let mut envelope = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!(
                    source = self.source_path,
                    "dropping json_event line that is not a JSON object"
                );
                return None;
            }
        };

        let has_type = envelope
            .get("@type")
            .and_then(Value::as_str)
            .is_some();
        if !has_type {
            if let Some(t) = &self.type_label {
                envelope.insert("@type".to_string(), Value::String(t.clone()));
            }
        }

        let tags = envelope
            .entry("@tags".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = tags {
            items.extend(self.tags.iter().cloned().map(Value::String));
        }

        for f in &self.fields {
            envelope.insert(f.name.clone(), Value::String(f.value.clone()));
        }

        Some(envelope)
    }

    fn apply_recipes(&self, envelope: &mut Map<String, Value>) {
        for recipe in &self.recipes {
            let source = envelope
                .get(&recipe.field)
                .and_then(Value::as_str)
                .map(str::to_string);
            let computed = match source {
                Some(text) => match recipe.pattern.captures(&text) {
                    Some(captures) => Some(expand_concat(&recipe.concat, &captures)),
                    None => recipe.default.clone(),
                },
                None => recipe.default.clone(),
            };
            let Some(computed) = computed else { continue };

            if self.flatten_fields {
                envelope.insert(recipe.name.clone(), Value::String(computed));
            } else {
                let fields = envelope
                    .entry("@fields".to_string())
                    .or_insert_with(|| json!({}));
                if let Value::Object(map) = fields {
                    map.insert(recipe.name.clone(), Value::String(computed));
                }
            }
        }
    }
}

/// Expand `$1`..`$9` references in a concat template against regex captures.
/// Missing groups expand to the empty string.
fn expand_concat(template: &str, captures: &regex::Captures) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            match chars.peek() {
                Some(&d @ '1'..='9') => {
                    chars.next();
                    let idx = d.to_digit(10).unwrap() as usize;
                    if let Some(group) = captures.get(idx) {
                        out.push_str(group.as_str());
                    }
                }
                Some('$') => {
                    chars.next();
                    out.push('$');
                }
                _ => out.push('$'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Render a local timestamp as ISO-8601 with a `±HH:MM` offset, optionally
/// with milliseconds. The legacy literal `UTC` suffix becomes `Z`.
pub fn format_timestamp(now: DateTime<Local>, milliseconds: bool) -> String {
    let base = now.format("%Y-%m-%dT%H:%M:%S").to_string();
    let offset = fix_offset(&now.format("%z").to_string());
    if milliseconds {
        format!("{}.{:03}{}", base, now.timestamp_subsec_millis(), offset)
    } else {
        format!("{}{}", base, offset)
    }
}

/// Rewrite a strftime `%z` offset (`+0200`, `-0700`, or the legacy literal
/// `UTC`) into `±HH:MM` / `Z`.
fn fix_offset(offset: &str) -> String {
    if offset == "UTC" {
        return "Z".to_string();
    }
    if offset.len() == 5 && (offset.starts_with('+') || offset.starts_with('-')) {
        return format!("{}:{}", &offset[..3], &offset[3..]);
    }
    offset.to_string()
}
