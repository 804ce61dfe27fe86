//! Request templates with `{{placeholder}}` substitution.
//!
//! Templates are parsed once when the configuration is validated; rendering
//! only walks the pre-split segments.

use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::ids::VuId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder {
    Vu,
    Iteration,
    TimestampMs,
    Uuid,
    UniqueEmail,
    Origin,
    BaseUrl,
    Setup(String),
}

impl Placeholder {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "vu" => Some(Self::Vu),
            "iter" => Some(Self::Iteration),
            "timestamp_ms" => Some(Self::TimestampMs),
            "uuid" => Some(Self::Uuid),
            "unique_email" => Some(Self::UniqueEmail),
            "origin" => Some(Self::Origin),
            "base_url" => Some(Self::BaseUrl),
            _ => {
                let var = name.strip_prefix("setup.")?;
                (!var.is_empty()).then(|| Self::Setup(var.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// Per-call data a template is rendered against.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub vu: VuId,
    pub iteration: u64,
    /// Fixed for the whole render so repeated placeholders agree.
    pub timestamp_ms: u128,
    pub base_url: &'a str,
    pub origin: &'a str,
    pub setup: &'a BTreeMap<String, String>,
}

impl TemplateContext<'_> {
    /// Address unique per (VU, iteration, millisecond).
    #[must_use]
    pub fn unique_email(&self) -> String {
        format!(
            "surge-{}-{}-{}@example.com",
            self.vu, self.iteration, self.timestamp_ms
        )
    }
}

/// A parsed string template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTemplate`] on an unterminated `{{` or an
    /// unknown placeholder name.
    pub fn parse(source: &str) -> CoreResult<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| CoreError::invalid_template(source, "unterminated `{{`"))?;
            let name = after[..close].trim();
            let placeholder = Placeholder::parse(name).ok_or_else(|| {
                CoreError::invalid_template(source, format!("unknown placeholder `{name}`"))
            })?;
            segments.push(Segment::Placeholder(placeholder));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Setup variables this template reads.
    pub fn setup_vars(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(Placeholder::Setup(var)) => Some(var.as_str()),
            _ => None,
        })
    }

    /// Renders the template. Missing setup variables render as empty strings.
    #[must_use]
    pub fn render(&self, ctx: &TemplateContext<'_>) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(p) => match p {
                    Placeholder::Vu => out.push_str(&ctx.vu.to_string()),
                    Placeholder::Iteration => out.push_str(&ctx.iteration.to_string()),
                    Placeholder::TimestampMs => out.push_str(&ctx.timestamp_ms.to_string()),
                    Placeholder::Uuid => out.push_str(&Uuid::new_v4().to_string()),
                    Placeholder::UniqueEmail => out.push_str(&ctx.unique_email()),
                    Placeholder::Origin => out.push_str(ctx.origin),
                    Placeholder::BaseUrl => out.push_str(ctx.base_url),
                    Placeholder::Setup(var) => {
                        if let Some(value) = ctx.setup.get(var) {
                            out.push_str(value);
                        }
                    }
                },
            }
        }
        out
    }
}

/// A JSON body whose string leaves are templates.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonTemplate {
    root: JsonNode,
}

#[derive(Debug, Clone, PartialEq)]
enum JsonNode {
    Text(Template),
    Array(Vec<JsonNode>),
    Object(Vec<(String, JsonNode)>),
    Literal(Value),
}

impl JsonNode {
    fn parse(value: Value) -> CoreResult<Self> {
        Ok(match value {
            Value::String(s) => Self::Text(Template::parse(&s)?),
            Value::Array(items) => Self::Array(
                items
                    .into_iter()
                    .map(Self::parse)
                    .collect::<CoreResult<_>>()?,
            ),
            Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| Self::parse(v).map(|node| (k, node)))
                    .collect::<CoreResult<_>>()?,
            ),
            other => Self::Literal(other),
        })
    }

    fn collect_setup_vars(&self, out: &mut Vec<String>) {
        match self {
            Self::Text(t) => out.extend(t.setup_vars().map(str::to_string)),
            Self::Array(items) => items.iter().for_each(|n| n.collect_setup_vars(out)),
            Self::Object(fields) => fields.iter().for_each(|(_, n)| n.collect_setup_vars(out)),
            Self::Literal(_) => {}
        }
    }

    fn render(&self, ctx: &TemplateContext<'_>) -> Value {
        match self {
            Self::Text(t) => Value::String(t.render(ctx)),
            Self::Array(items) => Value::Array(items.iter().map(|n| n.render(ctx)).collect()),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, n)| (k.clone(), n.render(ctx)))
                    .collect(),
            ),
            Self::Literal(v) => v.clone(),
        }
    }
}

impl JsonTemplate {
    /// Parses every string leaf as a [`Template`].
    ///
    /// # Errors
    ///
    /// Returns the first template error found.
    pub fn parse(value: Value) -> CoreResult<Self> {
        Ok(Self {
            root: JsonNode::parse(value)?,
        })
    }

    /// Setup variables referenced anywhere in the body.
    #[must_use]
    pub fn setup_vars(&self) -> Vec<String> {
        let mut vars = Vec::new();
        self.root.collect_setup_vars(&mut vars);
        vars
    }

    #[must_use]
    pub fn render(&self, ctx: &TemplateContext<'_>) -> Value {
        self.root.render(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(setup: &BTreeMap<String, String>) -> TemplateContext<'_> {
        TemplateContext {
            vu: VuId::new(3),
            iteration: 7,
            timestamp_ms: 1_700_000_000_000,
            base_url: "http://localhost:8080/api/v1",
            origin: "http://localhost:8080",
            setup,
        }
    }

    #[test]
    fn test_render_builtin_placeholders() {
        let setup = BTreeMap::new();
        let t = Template::parse("Load Test User {{vu}}-{{iter}}").unwrap();
        assert_eq!(t.render(&ctx(&setup)), "Load Test User 3-7");

        let t = Template::parse("{{origin}}/health").unwrap();
        assert_eq!(t.render(&ctx(&setup)), "http://localhost:8080/health");
    }

    #[test]
    fn test_unique_email_is_stable_within_context() {
        let setup = BTreeMap::new();
        let c = ctx(&setup);
        let t = Template::parse("{{unique_email}}|{{unique_email}}").unwrap();
        let rendered = t.render(&c);
        let (a, b) = rendered.split_once('|').unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "surge-3-7-1700000000000@example.com");
    }

    #[test]
    fn test_setup_vars() {
        let mut setup = BTreeMap::new();
        setup.insert("email".to_string(), "a@b.c".to_string());
        let t = Template::parse("{{ setup.email }}/{{setup.missing}}").unwrap();
        assert_eq!(t.setup_vars().collect::<Vec<_>>(), vec!["email", "missing"]);
        assert_eq!(t.render(&ctx(&setup)), "a@b.c/");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Template::parse("{{vu").is_err());
        assert!(Template::parse("{{nope}}").is_err());
        assert!(Template::parse("{{setup.}}").is_err());
        assert!(Template::parse("plain text").is_ok());
    }

    #[test]
    fn test_json_template() {
        let mut setup = BTreeMap::new();
        setup.insert("email".to_string(), "loadtest@example.com".to_string());
        let body = JsonTemplate::parse(json!({
            "email": "{{setup.email}}",
            "password": "password123",
            "nested": ["{{vu}}", 5, true],
        }))
        .unwrap();

        assert_eq!(body.setup_vars(), vec!["email".to_string()]);
        assert_eq!(
            body.render(&ctx(&setup)),
            json!({
                "email": "loadtest@example.com",
                "password": "password123",
                "nested": ["3", 5, true],
            })
        );

        assert!(JsonTemplate::parse(json!({ "bad": "{{what}}" })).is_err());
    }
}
