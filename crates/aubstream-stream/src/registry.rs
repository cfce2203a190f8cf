use std::collections::BTreeMap;
use std::sync::Arc;

use aubstream_types::{BasicGpu, GpuDescriptor, ProductFamily};

use crate::{Result, StreamError};

/// Maps product families to their descriptors.
///
/// Built once by whoever assembles sessions and passed by reference; there is no global
/// registration.
#[derive(Debug, Default, Clone)]
pub struct GpuRegistry {
    entries: BTreeMap<ProductFamily, Arc<dyn GpuDescriptor>>,
}

impl GpuRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding a [`BasicGpu`] for every known family.
    pub fn with_basic_descriptors() -> Self {
        let mut registry = Self::new();
        for family in ProductFamily::KNOWN {
            registry.register(Arc::new(BasicGpu::new(family)));
        }
        registry
    }

    /// Registers `gpu` under its family, returning the descriptor it replaced.
    pub fn register(&mut self, gpu: Arc<dyn GpuDescriptor>) -> Option<Arc<dyn GpuDescriptor>> {
        self.entries.insert(gpu.family(), gpu)
    }

    pub fn get(&self, family: ProductFamily) -> Option<Arc<dyn GpuDescriptor>> {
        self.entries.get(&family).cloned()
    }

    pub fn lookup(&self, family: ProductFamily) -> Result<Arc<dyn GpuDescriptor>> {
        self.get(family)
            .ok_or(StreamError::UnknownGpu { family })
    }

    pub fn families(&self) -> impl Iterator<Item = ProductFamily> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_registration_replaces_earlier() {
        let mut registry = GpuRegistry::new();
        assert!(registry.register(Arc::new(BasicGpu::new(ProductFamily::Dg2))).is_none());

        let mut richer = BasicGpu::new(ProductFamily::Dg2);
        richer.local_banks = 4;
        let replaced = registry.register(Arc::new(richer)).unwrap();
        assert_eq!(replaced.local_memory_banks(), 0);
        assert_eq!(registry.lookup(ProductFamily::Dg2).unwrap().local_memory_banks(), 4);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_family_is_an_error() {
        let registry = GpuRegistry::with_basic_descriptors();
        assert_eq!(registry.len(), ProductFamily::KNOWN.len());
        assert!(matches!(
            registry.lookup(ProductFamily::Unknown(77)),
            Err(StreamError::UnknownGpu {
                family: ProductFamily::Unknown(77)
            })
        ));
        assert_eq!(
            registry.families().collect::<Vec<_>>(),
            ProductFamily::KNOWN.to_vec()
        );
    }

    #[test]
    fn unknown_codes_do_not_shadow_known_families() {
        let mut registry = GpuRegistry::with_basic_descriptors();
        let mut odd = BasicGpu::new(ProductFamily::Unknown(ProductFamily::Skl.code()));
        odd.device_id = 0xBEEF;
        assert!(registry.register(Arc::new(odd)).is_none());

        assert_eq!(registry.len(), ProductFamily::KNOWN.len() + 1);
        assert_eq!(registry.lookup(ProductFamily::Skl).unwrap().device_id(), 0);
        assert_eq!(
            registry.families().last(),
            Some(ProductFamily::Unknown(ProductFamily::Skl.code()))
        );
    }
}
