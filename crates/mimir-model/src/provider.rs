// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{catalog, catalog::ModelCatalogEntry, StreamEvent, StreamOptions};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// An opaque handle over one provider + model combination.
///
/// The Session Agent is provider-agnostic: it sees only the unified
/// [`StreamEvent`] kinds.  All wire-format and auth variance lives behind
/// this trait.
impl std::fmt::Debug for dyn LanguageModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageModel")
            .field("provider_id", &self.provider_id())
            .field("model_id", &self.model_id())
            .finish()
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Stable provider id (e.g. `"anthropic"`), stamped on messages.
    fn provider_id(&self) -> &str;

    /// Model id as forwarded to the provider API.
    fn model_id(&self) -> &str;

    /// Run one generation step over the given history and tool set,
    /// returning the event stream.  Cancellation is cooperative: dropping
    /// the stream aborts the underlying request.
    async fn stream(&self, opts: StreamOptions) -> anyhow::Result<EventStream>;

    /// Catalog metadata (context window, cost rates, modalities).
    /// `None` for models the static catalog does not know.
    fn catalog(&self) -> Option<ModelCatalogEntry> {
        catalog::lookup(self.provider_id(), self.model_id())
    }

    /// Whether image attachments may be sent to this model.
    /// Conservative default when the model is unknown.
    fn supports_images(&self) -> bool {
        self.catalog().map(|e| e.supports_images).unwrap_or(false)
    }
}
