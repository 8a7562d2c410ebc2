use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use thiserror::Error;

use crate::domain::Event;
use crate::domain::event::FieldError;

const TYPE_PLACEHOLDER: &str = "{type}";

pub const DEFAULT_INDEX_TEMPLATE: &str = "rask-{type}-%Y.%m.%d";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("invalid index template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("cannot select index: {0}")]
    Field(#[from] FieldError),
}

/// Computes the destination index of an event from its type and timestamp.
///
/// `{type}` is substituted verbatim; everything else is a strftime pattern
/// applied to the event timestamp. The result is lowercased.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSelector {
    template: String,
    parts: Vec<String>,
}

impl IndexSelector {
    pub fn new(template: impl Into<String>) -> Result<Self, IndexError> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(IndexError::InvalidTemplate {
                template,
                reason: "template is empty".to_string(),
            });
        }

        let parts: Vec<String> = template
            .split(TYPE_PLACEHOLDER)
            .map(str::to_string)
            .collect();
        for part in &parts {
            if StrftimeItems::new(part).any(|item| matches!(item, Item::Error)) {
                return Err(IndexError::InvalidTemplate {
                    template,
                    reason: format!("bad strftime pattern in '{part}'"),
                });
            }
        }

        Ok(Self { template, parts })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn select(&self, event: &Event) -> Result<String, IndexError> {
        let timestamp = event.timestamp()?;
        let doc_type = event.doc_type()?;
        self.render(doc_type, timestamp)
    }

    pub fn render(&self, doc_type: &str, timestamp: DateTime<Utc>) -> Result<String, IndexError> {
        let mut out = String::with_capacity(self.template.len() + doc_type.len());
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                out.push_str(doc_type);
            }
            write!(out, "{}", timestamp.format(part)).map_err(|_| IndexError::InvalidTemplate {
                template: self.template.clone(),
                reason: format!("cannot format '{part}'"),
            })?;
        }
        Ok(out.to_lowercase())
    }
}

impl Default for IndexSelector {
    fn default() -> Self {
        Self {
            template: DEFAULT_INDEX_TEMPLATE.to_string(),
            parts: DEFAULT_INDEX_TEMPLATE
                .split(TYPE_PLACEHOLDER)
                .map(str::to_string)
                .collect(),
        }
    }
}
