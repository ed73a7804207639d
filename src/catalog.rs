//! Data Catalog Manager: periodic fetch of the GeoIP MMDB, the CN IPv4
//! CIDR list, and the GeoSite catalog; parse; hot-swap under a lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::geoip::{CnIpv4Index, GeoIp};
use crate::geosite::GeoSiteCatalog;

const MMDB_FILENAME: &str = "Country-without-asn.mmdb";
const CN_IPV4_FILENAME: &str = "cn-ipv4.txt";
const GEOSITE_FILENAME: &str = "direct-list.txt";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully loaded, internally consistent generation of the three resources.
#[derive(Clone)]
pub struct Catalogs {
    pub geoip: Arc<GeoIp>,
    pub geosite: Arc<GeoSiteCatalog>,
    /// RFC 3339 timestamp of when this generation was swapped in, for logs
    /// and diagnostics only — never consulted by the classifier.
    pub generation_at: String,
}

impl Catalogs {
    fn empty() -> Self {
        Self {
            geoip: Arc::new(GeoIp::empty()),
            geosite: Arc::new(GeoSiteCatalog::default()),
            generation_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn new(geoip: Arc<GeoIp>, geosite: Arc<GeoSiteCatalog>) -> Self {
        Self {
            geoip,
            geosite,
            generation_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Whatever the classifier asks for a snapshot from. Lets tests hand in
/// a fixed `Catalogs` value instead of standing up a full manager.
pub trait CatalogSource: Send + Sync {
    fn snapshot(&self) -> Catalogs;
}

impl CatalogSource for CatalogManager {
    fn snapshot(&self) -> Catalogs {
        self.current.read().clone()
    }
}

/// On-disk layout and mirror lists for one resource directory.
pub struct CatalogPaths {
    pub geoip_dir: PathBuf,
    pub geosite_dir: PathBuf,
}

impl CatalogPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            geoip_dir: data_dir.join("geoip"),
            geosite_dir: data_dir.join("geosite"),
        }
    }

    pub fn mmdb_path(&self) -> PathBuf {
        self.geoip_dir.join(MMDB_FILENAME)
    }

    pub fn cn_ipv4_path(&self) -> PathBuf {
        self.geoip_dir.join(CN_IPV4_FILENAME)
    }

    pub fn geosite_path(&self) -> PathBuf {
        self.geosite_dir.join(GEOSITE_FILENAME)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.geoip_dir)?;
        std::fs::create_dir_all(&self.geosite_dir)?;
        Ok(())
    }
}

/// Holds the current catalog generation behind a read-mostly guard, plus
/// a non-reentrant refresh flag. Readers clone the `Arc`s inside and keep
/// working against that snapshot even after a swap completes.
pub struct CatalogManager {
    client: reqwest::Client,
    paths: CatalogPaths,
    geoip_urls: Vec<String>,
    cn_ipv4_urls: Vec<String>,
    geosite_urls: Vec<String>,
    update_interval: Duration,
    current: RwLock<Catalogs>,
    refreshing: Mutex<()>,
}

impl CatalogManager {
    pub fn new(
        data_dir: &Path,
        geoip_urls: Vec<String>,
        cn_ipv4_urls: Vec<String>,
        geosite_urls: Vec<String>,
        update_interval: Duration,
    ) -> std::io::Result<Self> {
        let paths = CatalogPaths::new(data_dir);
        paths.ensure_dirs()?;
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .expect("failed to build catalog download client");
        Ok(Self {
            client,
            paths,
            geoip_urls,
            cn_ipv4_urls,
            geosite_urls,
            update_interval,
            current: RwLock::new(Catalogs::empty()),
            refreshing: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Catalogs {
        self.current.read().clone()
    }

    /// Ensure every resource exists and is fresh, downloading as needed,
    /// then parse everything into a fresh generation and swap it in.
    /// Called once at startup; failures here are fatal to the caller.
    ///
    /// Resources are downloaded independently via `download_all` — a
    /// failed geoip mirror list must not stop the geosite download from
    /// being attempted, same as at refresh time.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        self.download_all().await?;
        self.reload().await?;
        Ok(())
    }

    /// Spawn the single background refresher. Returns a token the caller
    /// can cancel to stop the loop.
    pub fn spawn_refresher(self: &Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let manager = Arc::clone(self);
        let child = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.update_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        tracing::debug!("catalog refresher cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.try_refresh().await;
                    }
                }
            }
        });
        token
    }

    /// Attempt one refresh cycle. Silently skipped if one is already in
    /// progress (non-reentrant, per the try-lock contract).
    pub async fn try_refresh(&self) {
        let guard = match self.refreshing.try_lock() {
            Some(g) => g,
            None => {
                tracing::debug!("catalog refresh already in progress, skipping tick");
                return;
            }
        };

        if let Err(e) = self.download_all().await {
            tracing::warn!(error = %e, "catalog download failed, retaining prior generation");
        }
        if let Err(e) = self.reload().await {
            tracing::warn!(error = %e, "catalog reload failed, retaining prior generation");
        }
        drop(guard);
    }

    async fn download_all(&self) -> anyhow::Result<()> {
        let mmdb = self.ensure_fresh(&self.paths.mmdb_path(), &self.geoip_urls).await;
        let cn_ipv4 = if self.cn_ipv4_urls.is_empty() {
            Ok(())
        } else {
            self.ensure_fresh(&self.paths.cn_ipv4_path(), &self.cn_ipv4_urls).await
        };
        let geosite = self.ensure_fresh(&self.paths.geosite_path(), &self.geosite_urls).await;

        // A download failure for one resource must not prevent refresh
        // of the others; log each independently, then bail only if the
        // required resources (geoip, geosite) both failed.
        if let Err(e) = &cn_ipv4 {
            tracing::warn!(error = %e, "cn ipv4 list refresh failed");
        }
        match (mmdb, geosite) {
            (Err(a), Err(b)) => anyhow::bail!("all required catalog downloads failed: {a}; {b}"),
            (Err(a), Ok(())) => {
                tracing::warn!(error = %a, "geoip mmdb refresh failed");
                Ok(())
            }
            (Ok(()), Err(b)) => {
                tracing::warn!(error = %b, "geosite refresh failed");
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Download `dest` from the first mirror that returns a 2xx response,
    /// streaming into a sibling temp file and renaming it into place.
    /// Skipped entirely if `dest` already exists and is younger than the
    /// refresh interval.
    async fn ensure_fresh(&self, dest: &Path, mirrors: &[String]) -> anyhow::Result<()> {
        if let Ok(meta) = std::fs::metadata(dest) {
            if let Ok(modified) = meta.modified() {
                if modified.elapsed().unwrap_or(Duration::MAX) < self.update_interval {
                    return Ok(());
                }
            }
        }
        self.download(dest, mirrors).await
    }

    async fn download(&self, dest: &Path, mirrors: &[String]) -> anyhow::Result<()> {
        if mirrors.is_empty() {
            anyhow::bail!("no mirror configured for {}", dest.display());
        }

        let mut last_err = None;
        for url in mirrors {
            match self.download_one(dest, url).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(url, error = %e, "mirror failed, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no mirrors tried")))
    }

    /// Stream the response body into a sibling temp file chunk by chunk
    /// (mirroring the original's `iter_chunked` download loop) rather than
    /// buffering the whole body in memory, then rename into place.
    async fn download_one(&self, dest: &Path, url: &str) -> anyhow::Result<()> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("{url} returned {}", resp.status());
        }

        let tmp = dest.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }

    /// Parse every resource off to the side, then swap all three under a
    /// single exclusive guard so readers never observe a mixed state.
    async fn reload(&self) -> anyhow::Result<()> {
        let mmdb_path = self.paths.mmdb_path();
        let cn_ipv4_path = self.paths.cn_ipv4_path();
        let geosite_path = self.paths.geosite_path();

        let reader = if mmdb_path.exists() {
            Some(GeoIp::open_mmdb(&mmdb_path)?)
        } else {
            None
        };
        let cn_ipv4 = if cn_ipv4_path.exists() {
            CnIpv4Index::parse(&std::fs::read_to_string(&cn_ipv4_path)?)
        } else {
            CnIpv4Index::default()
        };
        let geosite_text = std::fs::read_to_string(&geosite_path)?;
        let geosite = GeoSiteCatalog::parse(&geosite_text);

        let new_catalogs = Catalogs::new(Arc::new(GeoIp::new(reader, cn_ipv4)), Arc::new(geosite));
        let generation_at = new_catalogs.generation_at.clone();
        *self.current.write() = new_catalogs;
        tracing::info!(generation_at, "catalog generation swapped in");
        Ok(())
    }
}
