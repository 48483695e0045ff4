//! Opaque text-generation capability that step handlers may call.
//!
//! The engine never calls this itself. Handlers that need "generate text
//! given a prompt" hold a [`BoxTextGenerator`] and await it like any other
//! fallible call. Follows the same pattern as the run store:
//! 1. `TextGenerator` uses RPITIT for the async method
//! 2. `TextGeneratorDyn` is the object-safe mirror with boxed futures
//! 3. `BoxTextGenerator` wraps `Arc<dyn TextGeneratorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Errors surfaced by a text generator.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("generation failed: {0}")]
    Failed(String),
}

/// Something that turns a prompt into text (an agent, an LLM, a template).
pub trait TextGenerator: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn generate(
        &self,
        prompt: &str,
    ) -> impl Future<Output = Result<String, CapabilityError>> + Send;
}

/// Object-safe version of [`TextGenerator`].
pub trait TextGeneratorDyn: Send + Sync {
    fn name(&self) -> &str;

    fn generate_boxed<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, CapabilityError>> + Send + 'a>>;
}

impl<T: TextGenerator> TextGeneratorDyn for T {
    fn name(&self) -> &str {
        TextGenerator::name(self)
    }

    fn generate_boxed<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, CapabilityError>> + Send + 'a>> {
        Box::pin(self.generate(prompt))
    }
}

/// Shared, type-erased text generator.
#[derive(Clone)]
pub struct BoxTextGenerator {
    inner: Arc<dyn TextGeneratorDyn>,
}

impl BoxTextGenerator {
    pub fn new<T: TextGenerator>(generator: T) -> Self {
        Self {
            inner: Arc::new(generator),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn generate(&self, prompt: &str) -> Result<String, CapabilityError> {
        self.inner.generate_boxed(prompt).await
    }
}

impl std::fmt::Debug for BoxTextGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTextGenerator")
            .field("name", &self.inner.name())
            .finish()
    }
}
