use crate::failures::FailureLog;
use crate::llm::LlmError;
use crate::media::MediaFetcher;
use crate::models::{AttributeTask, WorkItem};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The external classification collaborator: given one attribute query,
/// return the chosen value. Retry/backoff for rate limiting is the
/// implementation's concern, not the processor's.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn resolve_attribute(&self, query: &AttributeQuery) -> Result<String, LlmError>;
}

/// Everything the classifier needs for one attribute sub-task.
#[derive(Debug, Clone)]
pub struct AttributeQuery {
    pub attribute_id: String,
    pub description: Option<String>,
    pub orientation: Option<String>,
    pub product_category: String,
    pub target_group: String,
    pub supplier_colour: Option<String>,
    /// `(identifier, label)` pairs in producer order. `None` for free-form
    /// attributes (`farbHex` never carries candidates).
    pub candidates: Option<Vec<(String, String)>>,
    /// Base64 data URLs, downloaded once per item and shared across its
    /// attributes.
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Enriched,
    /// No media references at all: recorded in the failure side channel,
    /// no classifier call made, no `resolved_value` touched.
    SkippedNoMedia,
}

pub struct ItemProcessor {
    classifier: Arc<dyn Classifier>,
    media: MediaFetcher,
    failures: Arc<FailureLog>,
}

impl ItemProcessor {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        media: MediaFetcher,
        failures: Arc<FailureLog>,
    ) -> Self {
        Self {
            classifier,
            media,
            failures,
        }
    }

    /// Resolve every attribute sub-task of `item` in order, mutating it in
    /// place. Per-attribute failures are absorbed: a failed classification
    /// stores an explicit `null` and processing continues.
    pub async fn process(&self, item: &mut WorkItem) -> ItemOutcome {
        let product_id = item.product_id.clone();
        let colour_id = item.colour_id.clone();
        let references: Vec<String> = item
            .media_references()
            .into_iter()
            .map(str::to_string)
            .collect();

        if references.is_empty() {
            error!(target: "attrib.processor", product_id = %product_id, "no media references supplied, item cannot be classified");
            self.failures
                .record(&product_id, colour_id.as_ref(), "-")
                .await;
            return ItemOutcome::SkippedNoMedia;
        }

        let mut images = Vec::new();
        for url in &references {
            match self.media.fetch_data_url(url).await {
                Ok(data_url) => images.push(data_url),
                Err(err) => {
                    error!(target: "attrib.processor", product_id = %product_id, url, error = %err, "media reference unusable");
                    self.failures
                        .record(&product_id, colour_id.as_ref(), url)
                        .await;
                }
            }
        }

        let product_category = item.product_category().unwrap_or_default().to_string();
        let target_group = item.target_group.clone().unwrap_or_default();
        let supplier_colour = colour_id.as_ref().map(|id| id.to_string());

        for attribute in &mut item.attributes {
            info!(
                target: "attrib.processor",
                product_id = %product_id,
                attribute = %attribute.identifier,
                "resolving attribute"
            );

            if images.is_empty() {
                warn!(target: "attrib.processor", product_id = %product_id, attribute = %attribute.identifier, "none of the media references could be fetched");
                attribute.resolved_value = Some(None);
                continue;
            }

            let query = AttributeQuery {
                attribute_id: attribute.identifier.clone(),
                description: attribute.description.clone(),
                orientation: attribute.orientation.clone(),
                product_category: product_category.clone(),
                target_group: target_group.clone(),
                supplier_colour: (attribute.identifier == "farbe")
                    .then(|| supplier_colour.clone())
                    .flatten(),
                candidates: candidates_for(attribute),
                images: images.clone(),
            };

            let resolved = match self.classifier.resolve_attribute(&query).await {
                Ok(value) => Some(value),
                Err(err) => {
                    error!(target: "attrib.processor", product_id = %product_id, attribute = %attribute.identifier, error = %err, "classifier call failed");
                    None
                }
            };
            if resolved.is_none() || resolved.as_deref() == Some("None") {
                warn!(
                    target: "attrib.processor",
                    product_id = %product_id,
                    attribute = %attribute.identifier,
                    "attribute could not be resolved"
                );
            }
            attribute.resolved_value = Some(resolved);
        }

        ItemOutcome::Enriched
    }
}

// The `farbHex` attribute expects free-form output and never gets a
// candidate description.
fn candidates_for(attribute: &AttributeTask) -> Option<Vec<(String, String)>> {
    if attribute.identifier == "farbHex" {
        return None;
    }
    attribute.candidates.as_ref().map(|candidates| {
        candidates
            .iter()
            .map(|candidate| {
                (
                    candidate.identifier.clone(),
                    candidate.label.clone().unwrap_or_default(),
                )
            })
            .collect()
    })
}
