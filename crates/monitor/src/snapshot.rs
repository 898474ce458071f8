//! Metrics snapshots and the provider that supplies them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_bootable::BoxError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Structured metrics captured at one poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken. Window spans are measured against this.
    pub taken_at: DateTime<Utc>,

    /// Metric tree, addressed by dotted paths.
    pub values: Value,
}

impl MetricsSnapshot {
    /// Snapshot taken now.
    #[must_use]
    pub fn new(values: Value) -> Self {
        Self::at(Utc::now(), values)
    }

    /// Snapshot with an explicit timestamp.
    #[must_use]
    pub const fn at(taken_at: DateTime<Utc>, values: Value) -> Self {
        Self { taken_at, values }
    }

    /// Resolves a dotted path such as `resources.memory_percent` or
    /// `services.0.failures` to a number. Booleans read as 1 or 0.
    ///
    /// # Errors
    ///
    /// [`Error::MissingMetric`] if any segment does not resolve,
    /// [`Error::NotNumeric`] if the leaf is not a number or boolean.
    pub fn lookup(&self, path: &str) -> Result<f64> {
        let leaf = walk(&self.values, path).ok_or_else(|| Error::MissingMetric {
            path: path.to_string(),
        })?;
        number(leaf, path)
    }

    /// Resolves a path whose one `*` segment stands for every key (or index)
    /// at that position, such as `services.*.failed_transitions`.
    ///
    /// Returns one `(subject, value)` pair per key, where the subject is the
    /// key the `*` matched. A path without `*` yields a single pair with an
    /// empty subject. Keys whose leaf cannot be read are returned with their
    /// error so the caller can decide whether the whole read failed.
    ///
    /// # Errors
    ///
    /// [`Error::MissingMetric`] if the segments before `*` do not resolve to
    /// an object or array.
    pub fn lookup_each(&self, path: &str) -> Result<Vec<(String, Result<f64>)>> {
        let Some((prefix, suffix)) = split_wildcard(path) else {
            return Ok(vec![(String::new(), self.lookup(path))]);
        };

        let parent = match prefix {
            Some(prefix) => walk(&self.values, prefix),
            None => Some(&self.values),
        };
        let missing = || Error::MissingMetric {
            path: path.to_string(),
        };

        let children: Vec<(String, &Value)> = match parent.ok_or_else(missing)? {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            _ => return Err(missing()),
        };

        Ok(children
            .into_iter()
            .map(|(subject, child)| {
                let concrete = concrete_path(prefix, &subject, suffix);
                let value = match suffix {
                    Some(suffix) => walk(child, suffix).map_or_else(
                        || {
                            Err(Error::MissingMetric {
                                path: concrete.clone(),
                            })
                        },
                        |leaf| number(leaf, &concrete),
                    ),
                    None => number(child, &concrete),
                };
                (subject, value)
            })
            .collect())
    }
}

/// Splits `a.*.b` into `(Some("a"), Some("b"))`. `None` when there is no `*`.
fn split_wildcard(path: &str) -> Option<(Option<&str>, Option<&str>)> {
    let segments: Vec<&str> = path.split('.').collect();
    let star = segments.iter().position(|segment| *segment == "*")?;

    let prefix_len: usize = segments[..star].iter().map(|s| s.len() + 1).sum();
    let prefix = (star > 0).then(|| &path[..prefix_len - 1]);
    let suffix = (star + 1 < segments.len()).then(|| &path[prefix_len + 2..]);
    Some((prefix, suffix))
}

fn concrete_path(prefix: Option<&str>, subject: &str, suffix: Option<&str>) -> String {
    [prefix, Some(subject), suffix]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(".")
}

fn walk<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }?;
    }
    Some(current)
}

fn number(leaf: &Value, path: &str) -> Result<f64> {
    match leaf {
        Value::Number(n) => n.as_f64().ok_or_else(|| Error::NotNumeric {
            path: path.to_string(),
        }),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Err(Error::MissingMetric {
            path: path.to_string(),
        }),
        _ => Err(Error::NotNumeric {
            path: path.to_string(),
        }),
    }
}

/// Supplies a metrics snapshot on each monitor poll.
#[async_trait]
pub trait MetricsProvider
where
    Self: Send + Sync,
{
    /// Capture the current metrics.
    async fn snapshot(&self) -> Result<MetricsSnapshot, BoxError>;
}
