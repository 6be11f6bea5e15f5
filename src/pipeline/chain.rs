//! Priority-ordered provider fallback

use std::future::Future;
use std::sync::Arc;

use super::{Provider, Stage};
use crate::{Error, Result};

/// Collaborators for one stage, tried in order until one succeeds
pub struct ProviderChain<P: ?Sized> {
    stage: Stage,
    providers: Vec<Arc<P>>,
}

impl<P: ?Sized> Clone for ProviderChain<P> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            providers: self.providers.clone(),
        }
    }
}

impl<P: Provider + ?Sized> ProviderChain<P> {
    /// Empty chain for `stage`
    #[must_use]
    pub const fn new(stage: Stage) -> Self {
        Self {
            stage,
            providers: Vec::new(),
        }
    }

    /// Append a lower-priority provider
    #[must_use]
    pub fn with(mut self, provider: Arc<P>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Append a lower-priority provider in place
    pub fn push(&mut self, provider: Arc<P>) {
        self.providers.push(provider);
    }

    /// Number of providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider names in priority order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Call providers in order, returning the first success
    ///
    /// # Errors
    ///
    /// Returns `DownstreamServiceError` for this stage if the chain is empty
    /// or every provider failed (carrying the last failure)
    pub async fn call<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for provider in &self.providers {
            match call(Arc::clone(provider)).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        stage = %self.stage,
                        provider = provider.name(),
                        error = %e,
                        "provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map_or_else(
            || Error::DownstreamServiceError {
                stage: self.stage,
                message: "no provider configured".to_string(),
            },
            |e| e.at_stage(self.stage),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, reply: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply,
                calls: AtomicUsize::new(0),
            })
        }

        fn answer(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(ToString::to_string)
                .ok_or_else(|| Error::Stt(format!("{} down", self.name)))
        }
    }

    impl Provider for Fixed {
        fn name(&self) -> &str {
            self.name
        }
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let primary = Fixed::new("primary", Some("one"));
        let fallback = Fixed::new("fallback", Some("two"));
        let chain = ProviderChain::new(Stage::Transcription)
            .with(Arc::clone(&primary))
            .with(Arc::clone(&fallback));

        let out = chain.call(|p| async move { p.answer() }).await.unwrap();
        assert_eq!(out, "one");
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_on_failure() {
        let primary = Fixed::new("primary", None);
        let fallback = Fixed::new("fallback", Some("two"));
        let chain = ProviderChain::new(Stage::Transcription)
            .with(Arc::clone(&primary))
            .with(Arc::clone(&fallback));

        let out = chain.call(|p| async move { p.answer() }).await.unwrap();
        assert_eq!(out, "two");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.names(), vec!["primary", "fallback"]);
    }

    #[tokio::test]
    async fn test_all_failed_reports_last_error_at_stage() {
        let chain = ProviderChain::new(Stage::Synthesis)
            .with(Fixed::new("a", None))
            .with(Fixed::new("b", None));

        let err = chain.call(|p| async move { p.answer() }).await.unwrap_err();
        match err {
            Error::DownstreamServiceError { stage, message } => {
                assert_eq!(stage, Stage::Synthesis);
                assert!(message.contains("b down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let chain: ProviderChain<Fixed> = ProviderChain::new(Stage::Reasoning);
        assert!(chain.is_empty());

        let err = chain.call(|p| async move { p.answer() }).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DownstreamServiceError { stage: Stage::Reasoning, .. }
        ));
    }
}
