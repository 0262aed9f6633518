use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::cache::{DistributedCache, Loader, NoDistributedCache};
use crate::config::CoreConfig;
use crate::error::{Result, StoreError};
use crate::tiered::{TieredCache, TieredCacheBuilder};

/// Storage key of the community settings in the distributed tier.
pub const SETTINGS_STORAGE_KEY: &str = "community:settings";

/// Community-wide settings row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunitySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_community_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_code: Option<String>,
    /// Columns this crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Source of truth for community settings.
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get_settings(&self) -> std::result::Result<Option<CommunitySettings>, StoreError>;

    async fn update_settings(
        &self,
        settings: &CommunitySettings,
    ) -> std::result::Result<(), StoreError>;

    async fn create_settings(
        &self,
        settings: &CommunitySettings,
    ) -> std::result::Result<(), StoreError>;
}

/// Anything that can name the community in user-facing messages.
#[async_trait]
pub trait CommunityNameSource: Send + Sync {
    async fn community_name(&self) -> Result<String>;
}

/// A fixed name.
#[async_trait]
impl CommunityNameSource for String {
    async fn community_name(&self) -> Result<String> {
        Ok(self.clone())
    }
}

/// Loader reading settings from a [`SettingsRepository`].
pub struct SettingsLoader<R>(Arc<R>);

#[async_trait]
impl<R: SettingsRepository> Loader<CommunitySettings> for SettingsLoader<R> {
    async fn load(&self) -> std::result::Result<Option<CommunitySettings>, StoreError> {
        self.0.get_settings().await
    }
}

/// Cached access to community settings.
pub struct SettingsService<R, D = NoDistributedCache> {
    repository: Arc<R>,
    cache: TieredCache<CommunitySettings, SettingsLoader<R>, D>,
    default_community_name: String,
}

impl<R: SettingsRepository> SettingsService<R, NoDistributedCache> {
    /// Creates a service with only the in-process tier.
    pub fn new(repository: Arc<R>, default_community_name: impl Into<String>) -> Self {
        let loader = SettingsLoader(Arc::clone(&repository));
        let cache = TieredCacheBuilder::new(SETTINGS_STORAGE_KEY, loader).build();
        Self {
            repository,
            cache,
            default_community_name: default_community_name.into(),
        }
    }
}

impl<R: SettingsRepository, D: DistributedCache> SettingsService<R, D> {
    /// Creates a service caching through `distributed`.
    pub fn with_distributed(
        repository: Arc<R>,
        distributed: D,
        memory_ttl: Duration,
        distributed_ttl: Duration,
        default_community_name: impl Into<String>,
    ) -> Self {
        let loader = SettingsLoader(Arc::clone(&repository));
        let cache = TieredCacheBuilder::new(SETTINGS_STORAGE_KEY, loader)
            .memory_ttl(memory_ttl)
            .distributed_ttl(distributed_ttl)
            .distributed(distributed)
            .build();
        Self {
            repository,
            cache,
            default_community_name: default_community_name.into(),
        }
    }

    /// Creates a service with lifetimes and default name taken from `config`.
    pub fn from_config(repository: Arc<R>, distributed: D, config: &CoreConfig) -> Self {
        let loader = SettingsLoader(Arc::clone(&repository));
        let cache = TieredCacheBuilder::new(SETTINGS_STORAGE_KEY, loader)
            .config(&config.cache)
            .distributed(distributed)
            .build();
        Self {
            repository,
            cache,
            default_community_name: config.workflow.default_community_name.clone(),
        }
    }

    /// Current settings, `None` when the row does not exist yet.
    pub async fn get_settings(&self) -> Result<Option<CommunitySettings>> {
        self.cache.get().await
    }

    /// Community name, falling back to the configured default.
    pub async fn community_name(&self) -> Result<String> {
        let name = self
            .cache
            .project(|settings| settings.community_name.clone())
            .await?;
        Ok(name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.default_community_name.clone()))
    }

    /// Updates the row and refreshes the cache with the new value.
    pub async fn update_settings(&self, settings: CommunitySettings) -> Result<()> {
        self.repository.update_settings(&settings).await?;
        self.refresh(settings).await;
        Ok(())
    }

    /// Creates the row and refreshes the cache with the new value.
    pub async fn create_settings(&self, settings: CommunitySettings) -> Result<()> {
        self.repository.create_settings(&settings).await?;
        self.refresh(settings).await;
        Ok(())
    }

    /// Drops cached settings so the next read hits the repository.
    pub async fn invalidate_cache(&self) -> Result<()> {
        self.cache.invalidate().await
    }

    // The repository already holds `settings`; cache failures are only logged.
    async fn refresh(&self, settings: CommunitySettings) {
        if let Err(err) = self.cache.set(settings).await {
            warn!(error = %err, "settings cache refresh failed");
        }
    }
}

#[async_trait]
impl<R: SettingsRepository, D: DistributedCache> CommunityNameSource for SettingsService<R, D> {
    async fn community_name(&self) -> Result<String> {
        SettingsService::community_name(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Repo {
        row: Mutex<Option<CommunitySettings>>,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl SettingsRepository for Repo {
        async fn get_settings(&self) -> std::result::Result<Option<CommunitySettings>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.row.lock().unwrap().clone())
        }

        async fn update_settings(
            &self,
            settings: &CommunitySettings,
        ) -> std::result::Result<(), StoreError> {
            let mut row = self.row.lock().unwrap();
            if row.is_none() {
                return Err("settings row missing".into());
            }
            *row = Some(settings.clone());
            Ok(())
        }

        async fn create_settings(
            &self,
            settings: &CommunitySettings,
        ) -> std::result::Result<(), StoreError> {
            *self.row.lock().unwrap() = Some(settings.clone());
            Ok(())
        }
    }

    fn named(name: &str) -> CommunitySettings {
        CommunitySettings {
            community_name: Some(name.to_string()),
            ..CommunitySettings::default()
        }
    }

    #[tokio::test]
    async fn community_name_falls_back_to_default() {
        let service = SettingsService::new(Arc::new(Repo::default()), "Default community");
        assert_eq!(service.community_name().await.unwrap(), "Default community");
    }

    #[tokio::test]
    async fn create_then_update_is_visible_without_reload() {
        let repo = Arc::new(Repo::default());
        let service = SettingsService::new(Arc::clone(&repo), "Default");

        service.create_settings(named("Bucha")).await.unwrap();
        assert_eq!(service.community_name().await.unwrap(), "Bucha");

        service.update_settings(named("Irpin")).await.unwrap();
        assert_eq!(service.community_name().await.unwrap(), "Irpin");
        assert_eq!(repo.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_update_leaves_cache_untouched() {
        let service = SettingsService::new(Arc::new(Repo::default()), "Default");
        assert!(service.update_settings(named("Ghost")).await.is_err());
        assert_eq!(service.community_name().await.unwrap(), "Default");
    }

    #[tokio::test]
    async fn invalidate_rereads_repository() {
        let repo = Arc::new(Repo::default());
        *repo.row.lock().unwrap() = Some(named("Bucha"));
        let service = SettingsService::new(Arc::clone(&repo), "Default");
        assert_eq!(service.community_name().await.unwrap(), "Bucha");

        *repo.row.lock().unwrap() = Some(named("Hostomel"));
        service.invalidate_cache().await.unwrap();

        assert_eq!(service.community_name().await.unwrap(), "Hostomel");
        assert_eq!(repo.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn from_config_uses_configured_default_name() {
        let mut config = CoreConfig::default();
        config.workflow.default_community_name = "Hromada".to_string();
        let service =
            SettingsService::from_config(Arc::new(Repo::default()), NoDistributedCache, &config);

        let source: &dyn CommunityNameSource = &service;
        assert_eq!(source.community_name().await.unwrap(), "Hromada");
    }

    #[test]
    fn unknown_columns_survive_round_trip() {
        let raw = serde_json::json!({ "community_name": "Bucha", "telegram_channel": "@bucha" });
        let settings: CommunitySettings = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&settings).unwrap(), raw);
    }
}
