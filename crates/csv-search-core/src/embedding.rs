//! Embedding provider trait.
//!
//! The encoder is an opaque collaborator: text in, fixed-length vector out.
//! Concrete providers (OpenAI, Ollama, fastembed, hashing) live in the
//! `csv-search` app crate.

use async_trait::async_trait;
use futures::lock::Mutex;

use crate::error::Result;

/// Trait for embedding providers.
///
/// `embed` must be deterministic for identical input and fail with
/// [`Error::Encoding`](crate::Error::Encoding). Callers only pass non-empty
/// text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"multilingual-e5-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn model_name(&self) -> &str {
        (**self).model_name()
    }
    fn dims(&self) -> usize {
        (**self).dims()
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text).await
    }
}

/// Runs every call of the wrapped provider inside one critical section.
///
/// Inference runtimes generally must not be driven concurrently; sharing a
/// single `SerializedProvider` between ingestion and query encoding
/// guarantees at most one `embed` is in flight.
pub struct SerializedProvider<P> {
    inner: P,
    gate: Mutex<()>,
}

impl<P: EmbeddingProvider> SerializedProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for SerializedProvider<P> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let _guard = self.gate.lock().await;
        self.inner.embed(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Probe {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Probe {
        fn model_name(&self) -> &str {
            "probe"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![1.0])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serialized_provider_never_overlaps() {
        let provider = Arc::new(SerializedProvider::new(Probe {
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        }));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let p = provider.clone();
                tokio::spawn(async move { p.embed(&format!("text {}", i)).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(provider.inner().max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(provider.model_name(), "probe");
    }
}
