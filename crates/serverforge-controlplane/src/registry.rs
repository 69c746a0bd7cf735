//! Vendor driver registry

use crate::error::Result;
use crate::model::ProviderAccount;
use crate::secrets::SecretCipher;
use serverforge_cloud::{CloudError, CloudProvider, ProviderCredentials, Vendor};
use serverforge_cloud_digitalocean::DigitalOceanProvider;
use serverforge_cloud_hetzner::HetznerProvider;
use serverforge_cloud_vultr::VultrProvider;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type DriverFactory = Arc<dyn Fn() -> Box<dyn CloudProvider> + Send + Sync>;

/// Resolves a [`CloudProvider`] per vendor.
///
/// [`driver`](Self::driver) hands out one shared, credential-less instance per
/// vendor for checks that run before anything is persisted.
/// [`for_account`](Self::for_account) and [`for_token`](Self::for_token)
/// always build a fresh instance, so one account's token is never visible to
/// another.
pub struct ProviderRegistry {
    factories: HashMap<Vendor, DriverFactory>,
    cache: Mutex<HashMap<Vendor, Arc<dyn CloudProvider>>>,
}

impl ProviderRegistry {
    /// Registry with the DigitalOcean, Hetzner and Vultr drivers
    pub fn new() -> Self {
        Self::empty()
            .register(Vendor::DigitalOcean, || Box::new(DigitalOceanProvider::new()))
            .register(Vendor::Hetzner, || Box::new(HetznerProvider::new()))
            .register(Vendor::Vultr, || Box::new(VultrProvider::new()))
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the driver for `vendor`
    pub fn register<F>(mut self, vendor: Vendor, factory: F) -> Self
    where
        F: Fn() -> Box<dyn CloudProvider> + Send + Sync + 'static,
    {
        self.factories.insert(vendor, Arc::new(factory));
        self.cache_guard().remove(&vendor);
        self
    }

    pub fn vendors(&self) -> Vec<Vendor> {
        let mut vendors: Vec<Vendor> = self.factories.keys().copied().collect();
        vendors.sort();
        vendors
    }

    fn factory(&self, vendor: Vendor) -> Result<&DriverFactory> {
        self.factories
            .get(&vendor)
            .ok_or_else(|| CloudError::UnknownProvider(vendor.to_string()).into())
    }

    fn cache_guard(&self) -> MutexGuard<'_, HashMap<Vendor, Arc<dyn CloudProvider>>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Shared instance without credentials
    pub fn driver(&self, vendor: Vendor) -> Result<Arc<dyn CloudProvider>> {
        let factory = self.factory(vendor)?;
        let mut cache = self.cache_guard();
        let driver = cache
            .entry(vendor)
            .or_insert_with(|| Arc::from(factory()))
            .clone();
        Ok(driver)
    }

    /// Fresh instance bound to a plaintext token
    pub fn for_token(&self, vendor: Vendor, api_token: &str) -> Result<Box<dyn CloudProvider>> {
        let mut provider = (self.factory(vendor)?)();
        provider.set_credentials(ProviderCredentials::new(api_token));
        Ok(provider)
    }

    /// Fresh instance bound to the account's decrypted token
    pub fn for_account(
        &self,
        account: &ProviderAccount,
        cipher: &dyn SecretCipher,
    ) -> Result<Box<dyn CloudProvider>> {
        let token = cipher.decrypt(&account.encrypted_token)?;
        self.for_token(account.vendor, &token)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;
    use crate::secrets::AesGcmCipher;
    use crate::store::fixtures;

    #[test]
    fn test_default_vendors() {
        let registry = ProviderRegistry::new();
        assert_eq!(
            registry.vendors(),
            vec![Vendor::DigitalOcean, Vendor::Hetzner, Vendor::Vultr]
        );
    }

    #[test]
    fn test_driver_is_cached() {
        let registry = ProviderRegistry::new();
        let a = registry.driver(Vendor::Hetzner).unwrap();
        let b = registry.driver(Vendor::Hetzner).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.vendor(), Vendor::Hetzner);
    }

    #[test]
    fn test_fresh_instance_per_token() {
        let registry = ProviderRegistry::new();
        let provider = registry.for_token(Vendor::Hetzner, "token").unwrap();
        assert_eq!(provider.vendor(), Vendor::Hetzner);
    }

    #[test]
    fn test_unregistered_vendor() {
        let registry = ProviderRegistry::empty();
        assert!(matches!(
            registry.driver(Vendor::Vultr),
            Err(LifecycleError::Cloud(CloudError::UnknownProvider(_)))
        ));
        assert!(matches!(
            registry.for_token(Vendor::Vultr, "token"),
            Err(LifecycleError::Cloud(CloudError::UnknownProvider(_)))
        ));
    }

    #[test]
    fn test_for_account_decrypts_token() {
        let registry = ProviderRegistry::new();
        let cipher = AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap();
        let mut account = fixtures::account("main");
        account.vendor = Vendor::DigitalOcean;
        account.encrypted_token = cipher.encrypt("do-token").unwrap();

        let provider = registry.for_account(&account, &cipher).unwrap();
        assert_eq!(provider.vendor(), Vendor::DigitalOcean);

        account.encrypted_token = "garbage".to_string();
        assert!(matches!(
            registry.for_account(&account, &cipher),
            Err(LifecycleError::Secret(_))
        ));
    }
}
