//! Plugin loader
//!
//! Discovers unpacked bundles under the install directory, registers a
//! runtime handle per plugin, publishes bundle assets to the media bucket
//! and drives each runtime to serving in the background.

use crate::config::PluginConfig;
use crate::metrics::Metrics;
use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use plugind_bundle::{BundlePackager, LocalBundlePackager, MediaBucket};
use plugind_runtime::{
    EnvironmentProvisioner, LocalPluginRuntime, PluginIdentity, PluginRuntime, PythonProvisioner,
    RuntimeRegistry, RuntimeState, Supervisor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct PluginLoader {
    registry: Arc<RuntimeRegistry>,
    media: MediaBucket,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    config: PluginConfig,
    metrics: Metrics,
    runtimes: DashMap<PluginIdentity, Arc<LocalPluginRuntime>>,
}

impl PluginLoader {
    pub fn new(
        registry: Arc<RuntimeRegistry>,
        media: MediaBucket,
        config: PluginConfig,
        metrics: Metrics,
    ) -> Arc<Self> {
        let provisioner = PythonProvisioner::new(&config.python_interpreter)
            .with_output_limit(config.max_captured_bytes);
        Self::with_provisioner(registry, media, Arc::new(provisioner), config, metrics)
    }

    pub fn with_provisioner(
        registry: Arc<RuntimeRegistry>,
        media: MediaBucket,
        provisioner: Arc<dyn EnvironmentProvisioner>,
        config: PluginConfig,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            media,
            provisioner,
            config,
            metrics,
            runtimes: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    /// Load every bundle directory under the install directory.
    ///
    /// Returns the number of plugins whose startup was scheduled; a broken
    /// bundle is logged and skipped.
    pub async fn load_all(self: &Arc<Self>) -> Result<usize> {
        let install_dir = &self.config.install_dir;
        if !tokio::fs::try_exists(install_dir).await.unwrap_or(false) {
            warn!("Plugin directory {} does not exist", install_dir.display());
            return Ok(0);
        }

        let mut entries = tokio::fs::read_dir(install_dir)
            .await
            .with_context(|| format!("read {}", install_dir.display()))?;

        let mut scheduled = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            match self.load(&path).await {
                Ok((identity, _)) => {
                    debug!("Scheduled {} from {}", identity, path.display());
                    scheduled += 1;
                }
                Err(e) => error!("Skipping plugin at {}: {:#}", path.display(), e),
            }
        }

        info!("Scheduled {} plugins from {}", scheduled, install_dir.display());
        Ok(scheduled)
    }

    /// Register the bundle at `dir` and start bringing it up.
    ///
    /// The returned task finishes once the runtime is serving or has failed.
    pub async fn load(self: &Arc<Self>, dir: &Path) -> Result<(PluginIdentity, JoinHandle<()>)> {
        let working_path = tokio::fs::canonicalize(dir)
            .await
            .with_context(|| format!("resolve {}", dir.display()))?;
        let bundle = open_bundle(working_path.clone()).await?;
        let manifest = bundle.manifest();

        if manifest.runner.language != self.provisioner.language() {
            bail!(
                "unsupported runner language {:?} for {}/{}",
                manifest.runner.language,
                manifest.author,
                manifest.name
            );
        }

        let identity =
            PluginIdentity::from_parts(&manifest.author, &manifest.name, &manifest.version);

        // Publish assets before registering, so a failed upload leaves no handle behind
        let mut media_ids = Vec::with_capacity(bundle.assets().len());
        for (name, content) in bundle.assets() {
            let id = self
                .media
                .upload(name, content)
                .await
                .with_context(|| format!("upload asset {name} of {identity}"))?;
            media_ids.push(id);
        }

        let handle = self.registry.begin(identity.clone(), &working_path)?;
        handle.bind_assets(media_ids);

        let runtime = Arc::new(LocalPluginRuntime::new(
            handle,
            self.provisioner.clone(),
            Supervisor::new(self.config.supervisor()),
            self.config.runtime(&manifest.runner.entrypoint),
        ));
        if let Some(previous) = self.runtimes.insert(identity.clone(), runtime.clone()) {
            previous.stop().await;
        }

        let loader = self.clone();
        let task = tokio::spawn(async move { loader.bring_up(runtime).await });
        Ok((identity, task))
    }

    async fn bring_up(self: Arc<Self>, runtime: Arc<LocalPluginRuntime>) {
        let identity = runtime.handle().identity().clone();
        let started = Instant::now();
        self.metrics.provisions_started.inc();

        let result = match runtime.init_environment().await {
            Ok(()) => runtime.start().await,
            Err(e) => Err(e),
        };
        self.metrics
            .provision_duration
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.metrics.provisions_succeeded.inc();
                info!("Plugin {} serving", identity);
                tokio::spawn(self.clone().track_ready(runtime.handle().subscribe()));
            }
            Err(e) => {
                self.metrics.provisions_failed.inc();
                match e.output() {
                    Some(output) if !output.is_empty() => {
                        error!("Plugin {} failed: {}\n{}", identity, e, output)
                    }
                    _ => error!("Plugin {} failed: {}", identity, e),
                }
                // Covers a start failure after the handle was already ready.
                runtime.handle().fail(e.to_string());
            }
        }
        self.refresh_ready_gauge();
    }

    /// Follow a serving runtime until it is failed or stopped, so the ready
    /// gauge also sees failures raised by its health monitor.
    async fn track_ready(self: Arc<Self>, mut states: watch::Receiver<RuntimeState>) {
        loop {
            let terminal = states.borrow_and_update().is_terminal();
            self.refresh_ready_gauge();
            if terminal || states.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop and forget one plugin.
    pub async fn unload(&self, identity: &PluginIdentity) -> bool {
        let runtime = self.runtimes.remove(identity).map(|(_, runtime)| runtime);
        if let Some(runtime) = &runtime {
            runtime.stop().await;
        }
        let evicted = self.registry.evict(identity).await.is_some();
        self.refresh_ready_gauge();
        runtime.is_some() || evicted
    }

    pub async fn shutdown(&self) {
        let runtimes: Vec<_> = self
            .runtimes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for runtime in runtimes {
            runtime.stop().await;
        }
        self.registry.shutdown_all().await;
        self.refresh_ready_gauge();
    }

    fn refresh_ready_gauge(&self) {
        self.metrics
            .ready_runtimes
            .set(self.registry.ready_count() as i64);
    }
}

async fn open_bundle(dir: PathBuf) -> Result<LocalBundlePackager> {
    let display = dir.display().to_string();
    let bundle = tokio::task::spawn_blocking(move || LocalBundlePackager::open(dir))
        .await
        .context("bundle reader panicked")?
        .with_context(|| format!("open bundle {display}"))?;
    Ok(bundle)
}
