//! Versioned image catalog: TTL-cached JSON index of downloadable disk images,
//! plus the local image cache it describes.
//!
//! The catalog lives at `<root>/images/catalog.json`. Downloaded images sit
//! next to it as `<name>-<version>.<format>`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use facet::Facet;

use crate::checksum;
use crate::config::EngineConfig;
use crate::download::{self, Downloader};
use crate::error::NidoError;
use crate::progress::{self, ProgressSink};
use crate::util;
use crate::vm::ImageProvider;

/// The only schema this engine reads.
pub const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct Catalog {
    pub schema_version: String,
    #[facet(default)]
    pub updated_at: String,
    #[facet(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct Image {
    pub name: String,
    /// `official` for upstream images, `optimized` for nido-built ones.
    #[facet(default)]
    pub registry: String,
    #[facet(default)]
    pub description: String,
    #[facet(default)]
    pub homepage: String,
    #[facet(default)]
    pub versions: Vec<Version>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct Version {
    pub version: String,
    #[facet(default)]
    pub aliases: Vec<String>,
    #[facet(default)]
    pub arch: String,
    #[facet(default)]
    pub url: String,
    /// Split assets; concatenated in order.
    #[facet(default)]
    pub part_urls: Vec<String>,
    #[facet(default)]
    pub checksum_type: String,
    #[facet(default)]
    pub checksum: String,
    #[facet(default)]
    pub size_bytes: u64,
    #[facet(default = "qcow2")]
    pub format: String,
}

/// Just the schema tag, read before committing to the full layout.
#[derive(Facet)]
struct SchemaTag {
    #[facet(default)]
    schema_version: String,
}

impl Version {
    fn answers_to(&self, wanted: &str) -> bool {
        self.version == wanted || self.aliases.iter().any(|a| a == wanted)
    }
}

impl Catalog {
    /// Check the schema tag, then parse. `origin` names the source in errors.
    ///
    /// Versions whose name, version or format would not make a plain file
    /// name in the image cache are dropped with a warning.
    pub fn parse(text: &str, origin: &str) -> Result<Self, NidoError> {
        let tag: SchemaTag = facet_json::from_str(text).map_err(|e| malformed(origin, e))?;
        if tag.schema_version != SCHEMA_VERSION {
            return Err(NidoError::SchemaVersion {
                found: tag.schema_version,
                expected: SCHEMA_VERSION.into(),
            });
        }

        let mut catalog: Catalog = facet_json::from_str(text).map_err(|e| malformed(origin, e))?;
        catalog.images.retain(|i| {
            let keep = plain_file_name(&i.name);
            if !keep {
                tracing::warn!(origin, image = %i.name, "skipping catalog image with an unsafe name");
            }
            keep
        });
        for image in &mut catalog.images {
            let name = image.name.clone();
            image.versions.retain(|v| match check_file_names(&name, v) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(origin, image = %name, version = %v.version, error = %e, "skipping catalog entry");
                    false
                }
            });
        }

        for (image, alias) in catalog.duplicate_aliases() {
            tracing::warn!(image, alias, "alias used by several versions; the first one wins");
        }
        Ok(catalog)
    }

    /// Resolve `name` (exact, case-sensitive) and `version` (version string or
    /// alias; empty means `latest`). The first matching version wins.
    pub fn find_image(&self, name: &str, version: &str) -> Result<(&Image, &Version), NidoError> {
        let wanted = if version.is_empty() { "latest" } else { version };
        let image = self
            .images
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| NidoError::not_found("image", name))?;
        let found = image
            .versions
            .iter()
            .find(|v| v.answers_to(wanted))
            .ok_or_else(|| NidoError::not_found("image version", format!("{name}:{wanted}")))?;
        Ok((image, found))
    }

    /// `(image, alias)` pairs where the alias is claimed by more than one
    /// version of the same image.
    pub fn duplicate_aliases(&self) -> Vec<(String, String)> {
        let mut dupes = Vec::new();
        for image in &self.images {
            let mut seen = HashSet::new();
            for alias in image.versions.iter().flat_map(|v| &v.aliases) {
                if !seen.insert(alias.as_str()) && !dupes.contains(&(image.name.clone(), alias.clone())) {
                    dupes.push((image.name.clone(), alias.clone()));
                }
            }
        }
        dupes
    }
}

// ── fetching ─────────────────────────────────────────────

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait CatalogFetcher {
    async fn fetch(&self, url: &str) -> Result<String, NidoError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl CatalogFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, NidoError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| NidoError::Download {
                message: format!("request to {url} failed"),
                source: Some(Box::new(e)),
            })?;
        if !response.status().is_success() {
            return Err(NidoError::Download {
                message: format!("HTTP {} from {url}", response.status()),
                source: None,
            });
        }
        response.text().await.map_err(|e| NidoError::Download {
            message: format!("error reading catalog body from {url}"),
            source: Some(Box::new(e)),
        })
    }
}

// ── cache inspection types ───────────────────────────────

/// A catalog entry whose file is present in the image cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Files matching a catalog entry.
    pub images: usize,
    pub image_bytes: u64,
    /// Leftover `.part` files and files the catalog does not describe.
    pub other_files: usize,
    pub other_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: usize,
    pub freed_bytes: u64,
    /// Skipped because a running VM is backed by them.
    pub kept_in_use: usize,
}

// ── manager ──────────────────────────────────────────────

pub struct CatalogManager<F = HttpFetcher> {
    images_dir: PathBuf,
    cache_file: PathBuf,
    url: String,
    ttl: Duration,
    fetcher: F,
    downloader: Downloader,
    show_progress: bool,
}

impl CatalogManager<HttpFetcher> {
    pub fn http(config: &EngineConfig) -> Self {
        Self::new(config, HttpFetcher::default(), Downloader::default())
    }
}

impl<F: CatalogFetcher> CatalogManager<F> {
    pub fn new(config: &EngineConfig, fetcher: F, downloader: Downloader) -> Self {
        Self {
            images_dir: config.layout.images_dir(),
            cache_file: config.layout.catalog_cache_path(),
            url: config.catalog_url.clone(),
            ttl: config.catalog_ttl,
            fetcher,
            downloader,
            show_progress: false,
        }
    }

    /// Draw terminal progress bars for image downloads.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Cached copy if younger than the TTL, else the remote one (persisted),
    /// else a stale cached copy.
    pub async fn load(&self) -> Result<Catalog, NidoError> {
        let cached = read_with_age(&self.cache_file).await;

        if let Some((text, age)) = &cached
            && *age < self.ttl
        {
            match Catalog::parse(text, "cache") {
                Ok(catalog) => {
                    tracing::debug!(age_secs = age.as_secs(), "using cached catalog");
                    return Ok(catalog);
                }
                Err(e @ NidoError::SchemaVersion { .. }) => return Err(e),
                Err(e) => tracing::warn!(error = %e, "ignoring unreadable catalog cache"),
            }
        }

        let fetch_error = match self.fetcher.fetch(&self.url).await {
            Ok(text) => match Catalog::parse(&text, &self.url) {
                Ok(catalog) => {
                    self.persist(&text).await;
                    tracing::info!(url = %self.url, images = catalog.images.len(), "fetched catalog");
                    return Ok(catalog);
                }
                Err(e @ NidoError::SchemaVersion { .. }) => return Err(e),
                Err(e) => e,
            },
            Err(e) => e,
        };

        tracing::warn!(url = %self.url, error = %fetch_error, "catalog fetch failed");
        let unreachable_error = || NidoError::CatalogUnreachable {
            message: fetch_error.to_string(),
        };
        let Some((text, _)) = cached else {
            return Err(unreachable_error());
        };
        match Catalog::parse(&text, "cache") {
            Ok(catalog) => {
                tracing::info!("falling back to stale catalog cache");
                Ok(catalog)
            }
            Err(e @ NidoError::SchemaVersion { .. }) => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "stale catalog cache is unreadable too");
                Err(unreachable_error())
            }
        }
    }

    async fn persist(&self, text: &str) {
        let result = async {
            tokio::fs::create_dir_all(&self.images_dir).await?;
            tokio::fs::write(&self.cache_file, text).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %self.cache_file.display(), error = %e, "failed to write catalog cache");
        }
    }

    /// Where the file for `image`/`version` lives in the cache.
    pub fn image_path(&self, image: &Image, version: &Version) -> PathBuf {
        self.images_dir
            .join(format!("{}-{}.{}", image.name, version.version, version.format))
    }

    /// `image_path`, refusing entries that would leave the cache directory.
    fn checked_image_path(&self, image: &Image, version: &Version) -> Result<PathBuf, NidoError> {
        check_file_names(&image.name, version).map_err(|message| NidoError::Validation {
            message: format!("catalog entry {}:{}: {message}", image.name, version.version),
        })?;
        Ok(self.image_path(image, version))
    }

    /// Resolve a reference and make sure its verified file is in the cache.
    pub async fn ensure_image(
        &self,
        name: &str,
        version: &str,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, NidoError> {
        let catalog = self.load().await?;
        let (image, version) = catalog.find_image(name, version)?;
        let path = self.checked_image_path(image, version)?;

        if tokio::fs::metadata(&path).await.is_ok() {
            tracing::info!(path = %path.display(), "using cached image");
            return Ok(path);
        }

        if !version.arch.is_empty() && version.arch != std::env::consts::ARCH {
            tracing::warn!(image = %image.name, version = %version.version, arch = %version.arch, "image architecture differs from host");
        }

        let size_hint = (version.size_bytes > 0).then_some(version.size_bytes);
        tracing::info!(image = %image.name, version = %version.version, "downloading image");
        if version.part_urls.is_empty() {
            self.downloader
                .fetch_part(&version.url, &path, size_hint, progress)
                .await?;
        } else {
            self.downloader
                .fetch_parts(&version.part_urls, &path, size_hint, progress)
                .await?;
        }

        // Only verified bytes ever reach the final name.
        let part = download::part_path(&path);
        if version.checksum.is_empty() {
            tracing::warn!(image = %image.name, version = %version.version, "catalog entry has no checksum");
        } else if let Err(e) = checksum::verify(&part, &version.checksum, &version.checksum_type).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
        download::commit(&path).await?;

        tracing::info!(path = %path.display(), "image ready");
        Ok(path)
    }

    /// Catalog entries whose files are present.
    pub async fn cached_images(&self, catalog: &Catalog) -> Vec<CachedImage> {
        let mut cached = Vec::new();
        for image in &catalog.images {
            for version in &image.versions {
                let path = self.image_path(image, version);
                if let Ok(meta) = tokio::fs::metadata(&path).await
                    && meta.is_file()
                {
                    cached.push(CachedImage {
                        name: image.name.clone(),
                        version: version.version.clone(),
                        path,
                        size_bytes: meta.len(),
                    });
                }
            }
        }
        cached
    }

    pub async fn cache_stats(&self, catalog: &Catalog) -> Result<CacheStats, NidoError> {
        let known: HashSet<PathBuf> = self
            .cached_images(catalog)
            .await
            .into_iter()
            .map(|c| c.path)
            .collect();

        let mut stats = CacheStats::default();
        for (path, size) in self.cache_files().await? {
            if known.contains(&path) {
                stats.images += 1;
                stats.image_bytes += size;
            } else {
                stats.other_files += 1;
                stats.other_bytes += size;
            }
        }
        Ok(stats)
    }

    /// Delete one cached image. Returns the bytes freed.
    pub async fn remove_cached_image(
        &self,
        catalog: &Catalog,
        name: &str,
        version: &str,
    ) -> Result<u64, NidoError> {
        let (image, version) = catalog.find_image(name, version)?;
        let path = self.checked_image_path(image, version)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| NidoError::not_found("cached image", format!("{name}:{}", version.version)))?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| NidoError::Io {
                context: format!("removing {}", path.display()),
                source: e,
            })?;
        let _ = tokio::fs::remove_file(download::part_path(&path)).await;
        tracing::info!(path = %path.display(), size = %util::format_size(meta.len()), "removed cached image");
        Ok(meta.len())
    }

    /// Delete cached files (images and partial downloads). With
    /// `unused_only`, files in `in_use` are kept.
    pub async fn prune_cache(
        &self,
        unused_only: bool,
        in_use: &HashSet<PathBuf>,
    ) -> Result<PruneReport, NidoError> {
        let mut report = PruneReport::default();
        for (path, size) in self.cache_files().await? {
            if unused_only && in_use.contains(&path) {
                report.kept_in_use += 1;
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    report.removed += 1;
                    report.freed_bytes += size;
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to prune"),
            }
        }
        tracing::info!(removed = report.removed, freed = %util::format_size(report.freed_bytes), "pruned image cache");
        Ok(report)
    }

    /// Every regular file in the cache except the catalog itself.
    async fn cache_files(&self) -> Result<Vec<(PathBuf, u64)>, NidoError> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.images_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => {
                return Err(NidoError::Io {
                    context: format!("reading {}", self.images_dir.display()),
                    source: e,
                });
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path() == self.cache_file {
                continue;
            }
            if let Ok(meta) = entry.metadata().await
                && meta.is_file()
            {
                files.push((entry.path(), meta.len()));
            }
        }
        files.sort();
        Ok(files)
    }
}

impl<F: CatalogFetcher> ImageProvider for CatalogManager<F> {
    async fn provide(&self, name: &str, version: &str) -> Result<PathBuf, NidoError> {
        if self.show_progress {
            let bar = progress::download_bar(&format!("{name}:{version}"));
            self.ensure_image(name, version, &bar).await
        } else {
            self.ensure_image(name, version, &()).await
        }
    }
}

fn malformed(origin: &str, error: impl std::fmt::Display) -> NidoError {
    NidoError::CatalogParse {
        origin: origin.to_string(),
        message: error.to_string(),
    }
}

/// Each of name, version and format must be a plain file-name fragment.
fn check_file_names(image: &str, version: &Version) -> Result<(), String> {
    for (what, value) in [
        ("name", image),
        ("version", version.version.as_str()),
        ("format", version.format.as_str()),
    ] {
        if !plain_file_name(value) {
            return Err(format!("{what} '{value}' is not a safe file name"));
        }
    }
    Ok(())
}

fn plain_file_name(value: &str) -> bool {
    !value.is_empty()
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

async fn read_with_age(path: &Path) -> Option<(String, Duration)> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let text = tokio::fs::read_to_string(path).await.ok()?;
    let age = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or_default();
    Some((text, age))
}
