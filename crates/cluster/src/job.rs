//! Templating job runner trait and the default substituting processor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use tend_core::{Error, Result};

use crate::source::SourceResolver;
use crate::types::{GitSource, Manifest, SourceTree};

/// One isolated rendering task: both sources pinned, executed under the
/// service account's identity constraints.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub template: GitSource,
    pub parameters: GitSource,
    pub processor_image: String,
    pub service_account: String,
}

/// Trait for the job/task execution substrate.
///
/// Implementations must be idempotent per (template revision, parameter
/// revision) pair: identical inputs yield an identical manifest set, ordered
/// deterministically from source ordering.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Execute one rendering task and return the manifest set.
    async fn run(&self, request: &RenderRequest) -> Result<Vec<Manifest>>;
}

/// Default in-process template processor.
///
/// Fetches both trees through a [`SourceResolver`], flattens the parameter
/// tree's YAML mappings into dotted keys, substitutes `${key}` tokens into
/// the template documents, and parses the result as YAML manifests ordered
/// by (file path, document index). This is a default processor, not a
/// templating language.
pub struct SubstJobRunner {
    resolver: Arc<dyn SourceResolver>,
    delay: Option<Duration>,
}

impl SubstJobRunner {
    /// Create a new processor backed by the given resolver.
    pub fn new(resolver: Arc<dyn SourceResolver>) -> Self {
        Self {
            resolver,
            delay: None,
        }
    }

    /// Add artificial latency before rendering. Test knob for exercising
    /// dispatch timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl JobRunner for SubstJobRunner {
    async fn run(&self, request: &RenderRequest) -> Result<Vec<Manifest>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        debug!(
            image = %request.processor_image,
            service_account = %request.service_account,
            template = %request.template,
            parameters = %request.parameters,
            "starting render task"
        );

        let templates = self.resolver.fetch(&request.template).await?;
        let parameters = self.resolver.fetch(&request.parameters).await?;
        let values = flatten_parameters(&parameters)?;

        let mut manifests = Vec::new();
        for (path, text) in &templates.files {
            let rendered = substitute(path, text, &values)?;
            for (index, document) in yaml_documents(path, &rendered)?.into_iter().enumerate() {
                if matches!(document, serde_yaml::Value::Null) {
                    continue;
                }
                manifests.push(parse_manifest(path, index, &document)?);
            }
        }
        debug!(manifests = manifests.len(), "render task complete");
        Ok(manifests)
    }
}

/// Flatten every parameter file's mappings into `a.b.c` keys. Later files
/// override earlier ones.
fn flatten_parameters(tree: &SourceTree) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for (path, text) in &tree.files {
        for document in yaml_documents(path, text)? {
            match document {
                serde_yaml::Value::Null => {}
                serde_yaml::Value::Mapping(_) => flatten_into(&mut values, "", path, &document)?,
                _ => {
                    return Err(Error::render(format!(
                        "parameter file '{path}' must contain mappings"
                    )))
                }
            }
        }
    }
    Ok(values)
}

fn flatten_into(
    out: &mut BTreeMap<String, String>,
    prefix: &str,
    path: &str,
    value: &serde_yaml::Value,
) -> Result<()> {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (key, nested) in map {
                let key = key.as_str().ok_or_else(|| {
                    Error::render(format!("parameter file '{path}' has a non-string key"))
                })?;
                let dotted = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(out, &dotted, path, nested)?;
            }
            Ok(())
        }
        serde_yaml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
            Ok(())
        }
        serde_yaml::Value::Number(n) => {
            out.insert(prefix.to_string(), n.to_string());
            Ok(())
        }
        serde_yaml::Value::Bool(b) => {
            out.insert(prefix.to_string(), b.to_string());
            Ok(())
        }
        serde_yaml::Value::Null => Ok(()),
        _ => Err(Error::render(format!(
            "parameter '{prefix}' in '{path}' has an unsupported value type"
        ))),
    }
}

/// Substitute `${key}` tokens. Unterminated or unresolvable placeholders are
/// render failures, not silent passthroughs.
fn substitute(path: &str, text: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            Error::render(format!("unterminated placeholder in '{path}'"))
        })?;
        let key = &after[..end];
        let value = values.get(key).ok_or_else(|| {
            Error::render(format!("unresolved parameter '${{{key}}}' in '{path}'"))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn yaml_documents(path: &str, text: &str) -> Result<Vec<serde_yaml::Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::render(format!("invalid YAML in '{path}': {e}")))?;
        documents.push(value);
    }
    Ok(documents)
}

fn parse_manifest(path: &str, index: usize, document: &serde_yaml::Value) -> Result<Manifest> {
    let payload: serde_json::Value = serde_json::to_value(document)
        .map_err(|e| Error::serialization(format!("document {index} in '{path}': {e}")))?;

    let field = |pointer: &str, name: &str| -> Result<String> {
        payload
            .pointer(pointer)
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                Error::render(format!(
                    "document {index} in '{path}' is missing {name}"
                ))
            })
    };

    Ok(Manifest {
        api_version: field("/apiVersion", "apiVersion")?,
        kind: field("/kind", "kind")?,
        namespace: payload
            .pointer("/metadata/namespace")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string),
        name: field("/metadata/name", "metadata.name")?,
        payload,
    })
}
