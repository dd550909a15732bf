//! Guest image loaders.
//!
//! A [`Loader`] turns an opened guest image into process memory. The session asks it for the
//! entry point before the process exists, creates the process, then lets the loader map the
//! image into it. Loaders are looked up by format tag in a [`LoaderRegistry`]; the default
//! registry knows the [`ImageFormat::Nro`] format.
//!
//! # Example
//!
//! ```rust
//! use guestkernel::{ImageFormat, LoaderRegistry};
//!
//! let registry = LoaderRegistry::default();
//! assert!(registry.supports(ImageFormat::Nro));
//! assert_eq!("NRO".parse::<ImageFormat>().unwrap(), ImageFormat::Nro);
//! ```

pub mod nro;

use std::collections::HashMap;

use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::{
    kernel::{config::KernelConfig, os::Kernel, process::GuestProcess},
    Error, File, Result,
};

/// Supported guest executable formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum ImageFormat {
    /// Relocatable homebrew executable (`NRO0`).
    Nro,
}

/// Maps a guest image into a process.
pub trait Loader: Send + Sync {
    /// Guest address the main thread starts at.
    fn main_entry(&self) -> u64;

    /// Maps the image into `process`.
    ///
    /// # Errors
    /// Returns mapping errors from the host, or [`Error::InvalidAddress`] on overlap.
    fn load_process_data(&self, process: &GuestProcess, kernel: &Kernel) -> Result<()>;
}

/// Constructs a loader for one image.
pub type LoaderFactory = Box<dyn Fn(File, &KernelConfig) -> Result<Box<dyn Loader>> + Send + Sync>;

/// Format tag to loader factory lookup.
pub struct LoaderRegistry {
    factories: HashMap<ImageFormat, LoaderFactory>,
}

impl LoaderRegistry {
    /// A registry without any formats.
    #[must_use]
    pub fn empty() -> Self {
        LoaderRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registers `factory` for `format`, replacing any previous registration.
    pub fn register<F>(&mut self, format: ImageFormat, factory: F)
    where
        F: Fn(File, &KernelConfig) -> Result<Box<dyn Loader>> + Send + Sync + 'static,
    {
        self.factories.insert(format, Box::new(factory));
    }

    /// Returns `true` if a loader is registered for `format`.
    #[must_use]
    pub fn supports(&self, format: ImageFormat) -> bool {
        self.factories.contains_key(&format)
    }

    /// Registered formats in declaration order.
    #[must_use]
    pub fn formats(&self) -> Vec<ImageFormat> {
        ImageFormat::iter().filter(|f| self.supports(*f)).collect()
    }

    /// Creates the loader for `image` from a format tag.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedFormat`] if the tag is unknown or has no registered loader
    /// - Any error the loader reports while validating the image
    pub fn create(&self, format: &str, image: File, config: &KernelConfig) -> Result<Box<dyn Loader>> {
        let Ok(parsed) = format.parse::<ImageFormat>() else {
            return Err(Error::UnsupportedFormat(format.to_string()));
        };
        let Some(factory) = self.factories.get(&parsed) else {
            return Err(Error::UnsupportedFormat(format.to_string()));
        };

        factory(image, config)
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        let mut registry = LoaderRegistry::empty();
        registry.register(ImageFormat::Nro, |image, config| {
            Ok(Box::new(nro::NroLoader::new(image, config)?) as Box<dyn Loader>)
        });
        registry
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("formats", &self.formats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::factories::nro_image;

    #[test]
    fn format_tags() {
        assert_eq!("nro".parse::<ImageFormat>().unwrap(), ImageFormat::Nro);
        assert_eq!("Nro".parse::<ImageFormat>().unwrap(), ImageFormat::Nro);
        assert!("nso".parse::<ImageFormat>().is_err());
        assert_eq!(ImageFormat::Nro.to_string(), "nro");
    }

    #[test]
    fn unknown_tag() {
        let registry = LoaderRegistry::default();
        let image = File::from_mem(nro_image(&[0; 4], &[], &[], 0)).unwrap();

        assert!(matches!(
            registry.create("unknown", image, &KernelConfig::default()),
            Err(Error::UnsupportedFormat(tag)) if tag == "unknown"
        ));
    }

    #[test]
    fn unregistered_format() {
        let registry = LoaderRegistry::empty();
        let image = File::from_mem(nro_image(&[0; 4], &[], &[], 0)).unwrap();

        assert!(registry.formats().is_empty());
        assert!(matches!(
            registry.create("nro", image, &KernelConfig::default()),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn default_creates_nro_loader() {
        let registry = LoaderRegistry::default();
        let image = File::from_mem(nro_image(&[0; 4], &[], &[], 0)).unwrap();
        let config = KernelConfig::default();

        let loader = registry.create("nro", image, &config).unwrap();
        assert_eq!(loader.main_entry(), config.guest_base);
        assert_eq!(registry.formats(), vec![ImageFormat::Nro]);
    }
}
