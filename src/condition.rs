//! When-phase readiness conditions
//!
//! A [`Condition`] is evaluated repeatedly by the [`Poller`] until it is
//! satisfied or its deadline passes. Each condition may carry its own
//! interval and timeout; otherwise the suite defaults apply.

use crate::client::{ResourceRef, ResourceStatus};
use crate::context::ScenarioContext;
use crate::poll::{ConditionError, PollError, Poller, Readiness};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// A When-phase readiness predicate
#[async_trait]
pub trait Condition: Send + Sync {
    /// What is being waited on, used in logs and timeout errors
    fn describe(&self) -> String;

    async fn evaluate(&self, ctx: &ScenarioContext) -> Result<Readiness, ConditionError>;

    /// Poll interval override
    fn interval(&self) -> Option<Duration> {
        None
    }

    /// Deadline override
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Poll a condition until it holds, using the suite defaults where it has none
pub async fn await_condition(
    ctx: &ScenarioContext,
    condition: &dyn Condition,
) -> Result<(), PollError> {
    let poller = Poller::new(
        condition.interval().unwrap_or(ctx.config().poll_interval),
        condition.timeout().unwrap_or(ctx.config().condition_timeout),
    );
    let resource = condition.describe();

    let attempts = poller
        .wait_for(&resource, || condition.evaluate(ctx))
        .await?;

    info!(
        scenario = %ctx.scenario(),
        condition = %resource,
        attempts = attempts,
        "Condition satisfied"
    );

    Ok(())
}

/// Exactly `replicas` pods matching `selector` are ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodsAreReady {
    replicas: usize,
    selector: String,
    interval: Option<Duration>,
    timeout: Option<Duration>,
}

/// Wait for exactly `replicas` ready pods matching a label selector
#[must_use]
pub fn pods_are_ready(replicas: usize, selector: impl Into<String>) -> PodsAreReady {
    PodsAreReady {
        replicas,
        selector: selector.into(),
        interval: None,
        timeout: None,
    }
}

impl PodsAreReady {
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Condition for PodsAreReady {
    fn describe(&self) -> String {
        format!("{} ready pods matching {}", self.replicas, self.selector)
    }

    async fn evaluate(&self, ctx: &ScenarioContext) -> Result<Readiness, ConditionError> {
        validate_selector(&self.selector)?;

        let status = ctx
            .client()
            .status(&ResourceRef::Pods {
                namespace: ctx.namespace().to_string(),
                selector: self.selector.clone(),
            })
            .await?;

        match status {
            ResourceStatus::Pods { ready, .. } if ready == self.replicas => {
                Ok(Readiness::Satisfied)
            }
            ResourceStatus::Pods { ready, total } => Ok(Readiness::NotYet(format!(
                "{ready}/{} pods ready ({total} matching)",
                self.replicas
            ))),
            other => Err(ConditionError::Fatal(format!(
                "unexpected status for pods: {other}"
            ))),
        }
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// A service exists and has at least one ready endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIsReady {
    name: String,
    interval: Option<Duration>,
    timeout: Option<Duration>,
}

/// Wait for a service with at least one ready endpoint
#[must_use]
pub fn service_is_ready(name: impl Into<String>) -> ServiceIsReady {
    ServiceIsReady {
        name: name.into(),
        interval: None,
        timeout: None,
    }
}

impl ServiceIsReady {
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Condition for ServiceIsReady {
    fn describe(&self) -> String {
        format!("service/{}", self.name)
    }

    async fn evaluate(&self, ctx: &ScenarioContext) -> Result<Readiness, ConditionError> {
        if self.name.is_empty() {
            return Err(ConditionError::Fatal(
                "service name cannot be empty".to_string(),
            ));
        }

        let status = ctx
            .client()
            .status(&ResourceRef::Service {
                namespace: ctx.namespace().to_string(),
                name: self.name.clone(),
            })
            .await?;

        match status {
            ResourceStatus::Service { endpoints } if endpoints > 0 => Ok(Readiness::Satisfied),
            ResourceStatus::Service { .. } => {
                Ok(Readiness::NotYet("service has no ready endpoints".to_string()))
            }
            other => Err(ConditionError::Fatal(format!(
                "unexpected status for service: {other}"
            ))),
        }
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Check a label selector for syntax errors
///
/// Accepts the equality-based (`k=v`, `k==v`, `k!=v`), existence (`k`, `!k`)
/// set-based (`k in (a,b)`, `k notin(a)`) and numeric (`k>1`, `k<3`) forms,
/// comma separated.
pub fn validate_selector(selector: &str) -> Result<(), ConditionError> {
    let fatal = |reason: String| ConditionError::Fatal(format!("invalid selector '{selector}': {reason}"));

    if selector.trim().is_empty() {
        return Err(fatal("selector cannot be empty".to_string()));
    }

    for term in split_terms(selector).map_err(fatal)? {
        let term = term.trim();

        if let Some((key, rest)) = split_set_term(term) {
            let values = rest
                .trim()
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| fatal(format!("malformed set in '{term}'")))?;
            validate_key(key).map_err(fatal)?;
            for value in values.split(',') {
                validate_value(value.trim()).map_err(fatal)?;
            }
            continue;
        }

        if let Some((key, bound)) = term.split_once(|c| c == '>' || c == '<') {
            validate_key(key.trim()).map_err(fatal)?;
            bound
                .trim()
                .parse::<i64>()
                .map_err(|_| fatal(format!("'{term}' needs an integer bound")))?;
            continue;
        }

        if let Some(key) = term.strip_prefix('!') {
            validate_key(key.trim()).map_err(fatal)?;
            continue;
        }

        let (key, value) = if let Some((k, v)) = term.split_once("!=") {
            (k, Some(v))
        } else if let Some((k, v)) = term.split_once("==") {
            (k, Some(v))
        } else if let Some((k, v)) = term.split_once('=') {
            (k, Some(v))
        } else {
            (term, None)
        };

        validate_key(key.trim()).map_err(fatal)?;
        if let Some(value) = value {
            validate_value(value.trim()).map_err(fatal)?;
        }
    }

    Ok(())
}

/// Split on commas that are not inside parentheses
fn split_terms(selector: &str) -> Result<Vec<&str>, String> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced ')'".to_string())?;
            }
            ',' if depth == 0 => {
                terms.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err("unbalanced '('".to_string());
    }
    terms.push(&selector[start..]);

    Ok(terms)
}

/// `key in (..)` or `key notin(..)`, returning the key and the parenthesized rest
fn split_set_term(term: &str) -> Option<(&str, &str)> {
    let key_end = term.find(|c: char| c.is_whitespace() || c == '(')?;
    let (key, rest) = term.split_at(key_end);
    let rest = rest.trim_start();

    ["notin", "in"].iter().find_map(|op| {
        rest.strip_prefix(op)
            .map(str::trim_start)
            .filter(|values| values.starts_with('('))
            .map(|values| (key.trim(), values))
    })
}

fn validate_key(key: &str) -> Result<(), String> {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || prefix.len() > 253 {
                return Err(format!("invalid key prefix in '{key}'"));
            }
            if !prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
            {
                return Err(format!("invalid key prefix in '{key}'"));
            }
            name
        }
        None => key,
    };

    if name.is_empty() {
        return Err("label key cannot be empty".to_string());
    }
    if !is_label_name(name) {
        return Err(format!("invalid label key '{key}'"));
    }

    Ok(())
}

fn validate_value(value: &str) -> Result<(), String> {
    if value.is_empty() || is_label_name(value) {
        Ok(())
    } else {
        Err(format!("invalid label value '{value}'"))
    }
}

/// Alphanumeric at both ends, `-_.` allowed inside, at most 63 characters
fn is_label_name(s: &str) -> bool {
    let bytes = s.as_bytes();

    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}
