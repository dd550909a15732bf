//! Fluent assembly of a [`Kernel`] session.

use std::sync::Arc;

use crate::{
    kernel::{
        config::KernelConfig,
        engine::ExecutionEngine,
        host::{HostPlatform, LinuxHost},
        loader::{ImageFormat, Loader, LoaderRegistry},
        os::Kernel,
    },
    Error, File, Result,
};

/// Builder for [`Kernel`] sessions.
///
/// An execution engine is required. The host defaults to [`LinuxHost`], the configuration to
/// [`KernelConfig::default`], and the loader registry to [`LoaderRegistry::default`].
///
/// # Examples
///
/// ```rust,ignore
/// use guestkernel::{Kernel, KernelConfig};
///
/// let kernel = Kernel::builder()
///     .engine(MyEngine::new())
///     .config(KernelConfig::default().with_default_stack_size(0x10_0000))
///     .build()?;
/// ```
#[derive(Default)]
pub struct KernelBuilder {
    host: Option<Arc<dyn HostPlatform>>,
    engine: Option<Arc<dyn ExecutionEngine>>,
    config: KernelConfig,
    loaders: Option<LoaderRegistry>,
}

impl KernelBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host platform.
    #[must_use]
    pub fn host<H: HostPlatform + 'static>(self, host: H) -> Self {
        self.host_arc(Arc::new(host))
    }

    /// Sets a shared host platform.
    #[must_use]
    pub fn host_arc(mut self, host: Arc<dyn HostPlatform>) -> Self {
        self.host = Some(host);
        self
    }

    /// Sets the execution engine.
    #[must_use]
    pub fn engine<E: ExecutionEngine + 'static>(self, engine: E) -> Self {
        self.engine_arc(Arc::new(engine))
    }

    /// Sets a shared execution engine.
    #[must_use]
    pub fn engine_arc(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Sets the session configuration.
    #[must_use]
    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a loader factory for `format`, replacing the built-in one if present.
    #[must_use]
    pub fn loader<F>(mut self, format: ImageFormat, factory: F) -> Self
    where
        F: Fn(File, &KernelConfig) -> Result<Box<dyn Loader>> + Send + Sync + 'static,
    {
        self.loaders
            .get_or_insert_with(LoaderRegistry::default)
            .register(format, factory);
        self
    }

    /// Starts from an empty loader registry instead of the built-in formats.
    #[must_use]
    pub fn without_default_loaders(mut self) -> Self {
        self.loaders = Some(LoaderRegistry::empty());
        self
    }

    /// Validates the settings and creates the session.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if no engine was set, the guest range is empty or
    /// wraps, or the default stack size is zero.
    pub fn build(self) -> Result<Kernel> {
        let Some(engine) = self.engine else {
            return Err(Error::Configuration(
                "an execution engine is required".to_string(),
            ));
        };

        let config = self.config;
        if config.guest_extent == 0 || config.guest_base.checked_add(config.guest_extent).is_none()
        {
            return Err(Error::Configuration(format!(
                "invalid guest range {:#x}+{:#x}",
                config.guest_base, config.guest_extent
            )));
        }
        if config.default_stack_size == 0 {
            return Err(Error::Configuration(
                "default stack size must not be zero".to_string(),
            ));
        }

        let host = self
            .host
            .unwrap_or_else(|| Arc::new(LinuxHost::new()) as Arc<dyn HostPlatform>);
        let loaders = self.loaders.unwrap_or_default();

        Ok(Kernel::new(host, engine, config, loaders))
    }
}

impl std::fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBuilder")
            .field("host", &self.host)
            .field("engine", &self.engine.is_some())
            .field("config", &self.config)
            .field("loaders", &self.loaders)
            .finish()
    }
}
