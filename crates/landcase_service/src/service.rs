use std::path::PathBuf;
use std::sync::Arc;

use landcase_core::{
    case_folder_name, compute_case_id, validate_variables, CaseDefinition, CaseRecord, CaseStatus,
    CaseWithTaskInfo, RegistryHandle,
};
use landcase_toolchain::{PlanExecutor, ToolchainLayout};

use crate::executor::{TaskExecutor, TokioTaskExecutor};
use crate::reconcile;
use crate::sites::SiteLink;
use crate::store::{now_unix_millis, CaseStore, FsCaseStore, StoreError};
use crate::ServiceError;

/// Explicit service configuration, constructed by the embedder and injected
/// at build time. No process-wide singletons: tests run with one config per
/// service instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub model_root: PathBuf,
    pub cases_root: PathBuf,
    pub records_root: PathBuf,
    pub data_root: PathBuf,
    pub archives_root: PathBuf,
    pub shared_data_root: PathBuf,
    pub registry_path: PathBuf,
    pub machine_name: String,
    pub version_tag: String,
}

impl ServiceConfig {
    /// Conventional layout under a single resources root.
    pub fn new(resources_root: impl Into<PathBuf>, version_tag: impl Into<String>) -> Self {
        let root = resources_root.into();
        Self {
            model_root: root.join("model"),
            cases_root: root.join("cases"),
            records_root: root.join("records"),
            data_root: root.join("data"),
            archives_root: root.join("archives"),
            shared_data_root: root.join("inputdata"),
            registry_path: root.join("config").join("variables_config.json"),
            machine_name: "container".to_owned(),
            version_tag: version_tag.into(),
        }
    }

    pub fn with_model_root(mut self, model_root: impl Into<PathBuf>) -> Self {
        self.model_root = model_root.into();
        self
    }

    pub fn with_machine_name(mut self, machine_name: impl Into<String>) -> Self {
        self.machine_name = machine_name.into();
        self
    }

    pub fn with_registry_path(mut self, registry_path: impl Into<PathBuf>) -> Self {
        self.registry_path = registry_path.into();
        self
    }
}

/// Case orchestration facade: validation, identity, dedup, dispatch, and
/// the composed read path. An HTTP layer mounts these methods one-to-one.
pub struct CaseService {
    config: ServiceConfig,
    registry: Arc<RegistryHandle>,
    store: Arc<dyn CaseStore>,
    executor: Arc<dyn TaskExecutor>,
}

impl CaseService {
    /// Build the fully wired service. The toolchain installation check is
    /// startup-fatal: a missing script suite prevents the service from
    /// accepting any request instead of failing case-by-case.
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        let layout = ToolchainLayout::new(&config.model_root);
        layout.verify_installation()?;

        let registry = Arc::new(RegistryHandle::load(&config.registry_path)?);
        let store: Arc<dyn CaseStore> = Arc::new(FsCaseStore::new(&config.records_root));
        let runner = Arc::new(PlanExecutor::new(
            layout,
            config.machine_name.clone(),
            &config.cases_root,
            &config.shared_data_root,
        ));
        let executor: Arc<dyn TaskExecutor> = Arc::new(TokioTaskExecutor::new(
            runner,
            Arc::clone(&registry),
            Arc::clone(&store),
        ));
        Ok(Self::with_parts(config, registry, store, executor))
    }

    /// Assemble from externally built parts. Skips the installation check;
    /// used by embedders with their own wiring and by tests.
    pub fn with_parts(
        config: ServiceConfig,
        registry: Arc<RegistryHandle>,
        store: Arc<dyn CaseStore>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            executor,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validate, derive the identity, and either reuse the existing case or
    /// create and dispatch a new one.
    ///
    /// Dedup policy: an existing non-failed record is returned unchanged (no
    /// second task, no second directory); a failed record is fully removed
    /// and recreated under the same id. The insert is atomic on id, so a
    /// racing creator that loses re-reads the winner's record.
    pub async fn create_or_reuse(
        &self,
        mut definition: CaseDefinition,
    ) -> Result<CaseWithTaskInfo, ServiceError> {
        // A request without a version tag targets the installed model.
        if definition.version_tag.is_empty() {
            definition.version_tag = self.config.version_tag.clone();
        }

        let registry = self.registry.get();
        let variables = validate_variables(&definition.variables, &registry)?;
        let id = compute_case_id(
            &definition.compset,
            definition.resolution.as_deref(),
            &variables,
            &definition.data_reference,
            definition.driver,
            &definition.version_tag,
        );

        if let Some(existing) = self.load(&id).await? {
            if existing.status != CaseStatus::Failed {
                tracing::info!(case_id = %id, status = %existing.status, "reusing existing case");
                return Ok(self.compose(existing).await);
            }
            tracing::info!(case_id = %id, "recreating failed case");
            self.remove_artifacts_and_record(&existing).await?;
        }

        let folder_name = case_folder_name(&id, definition.name.as_deref());
        let record = CaseRecord::new(
            &definition,
            variables,
            id.clone(),
            folder_name,
            &self.config.data_root,
            now_unix_millis(),
        );

        let inserted = {
            let record = record.clone();
            self.store_io(move |store| store.insert_new(&record)).await
        };
        match inserted {
            Ok(()) => {}
            Err(ServiceError::Store(StoreError::Conflict(_))) => {
                // Lost the check-then-create race; the winner's record is
                // authoritative and already carries the task handle.
                let existing = self.load(&id).await?.ok_or_else(|| {
                    ServiceError::Internal(format!("case {id} vanished after insert conflict"))
                })?;
                return Ok(self.compose(existing).await);
            }
            Err(err) => return Err(err),
        }

        let task_id = self.executor.submit_create(&record).await?;
        tracing::info!(case_id = %id, task_id = %task_id, "case created and dispatched");
        let updated = {
            let id = id.clone();
            self.store_io(move |store| store.set_create_task(&id, &task_id))
                .await?
        };
        Ok(self.compose(updated).await)
    }

    /// Dispatch the run phase. The transient BUILDING status is persisted
    /// before submission so concurrent readers never see a stale CONFIGURED
    /// while the build task is already queued.
    pub async fn run_case(&self, case_id: &str) -> Result<Option<CaseWithTaskInfo>, ServiceError> {
        if self.load(case_id).await?.is_none() {
            return Ok(None);
        }

        let building = {
            let id = case_id.to_owned();
            self.store_io(move |store| store.update_status(&id, CaseStatus::Building))
                .await?
        };
        let task_id = self.executor.submit_run(&building).await?;
        tracing::info!(case_id, task_id = %task_id, "run phase dispatched");
        let updated = {
            let id = case_id.to_owned();
            self.store_io(move |store| store.set_run_task(&id, &task_id))
                .await?
        };
        Ok(Some(self.compose(updated).await))
    }

    /// Read one case with live task views; a miss is a `None`, not an error.
    pub async fn get_case(&self, case_id: &str) -> Result<Option<CaseWithTaskInfo>, ServiceError> {
        match self.load(case_id).await? {
            Some(record) => Ok(Some(self.compose(record).await)),
            None => Ok(None),
        }
    }

    pub async fn list_cases(&self) -> Result<Vec<CaseWithTaskInfo>, ServiceError> {
        let records = self.store_io(|store| store.list()).await?;
        let mut composed = Vec::with_capacity(records.len());
        for record in records {
            composed.push(self.compose(record).await);
        }
        Ok(composed)
    }

    /// Delete the record and everything derived from it: case directory,
    /// cached archive, case-local data directory, site links, and the
    /// executor's bookkeeping for outstanding handles.
    pub async fn remove_case(&self, case_id: &str) -> Result<Option<CaseRecord>, ServiceError> {
        let Some(record) = self.load(case_id).await? else {
            return Ok(None);
        };
        self.remove_artifacts_and_record(&record).await?;
        Ok(Some(record))
    }

    /// Link a site name to an existing case, keeping at most one link per
    /// driver for the site.
    pub async fn link_site(&self, site_name: &str, case_id: &str) -> Result<(), ServiceError> {
        let Some(case) = self.load(case_id).await? else {
            return Err(ServiceError::UnknownCase(case_id.to_owned()));
        };

        let links = self.store_io(|store| store.site_links()).await?;
        for link in links {
            if link.name != site_name || link.case_id == case.id {
                continue;
            }
            let same_driver = match self.load(&link.case_id).await? {
                Some(linked_case) => linked_case.driver == case.driver,
                // Dangling link; drop it while we are here.
                None => true,
            };
            if same_driver {
                let stale = link.clone();
                self.store_io(move |store| store.remove_link(&stale)).await?;
            }
        }

        let link = SiteLink::new(site_name, case_id);
        self.store_io(move |store| store.link_site(&link)).await
    }

    /// All cases linked to a site name, composed with task views. Links to
    /// removed cases are skipped.
    pub async fn cases_for_site(
        &self,
        site_name: &str,
    ) -> Result<Vec<CaseWithTaskInfo>, ServiceError> {
        let links = self.store_io(|store| store.site_links()).await?;
        let mut composed = Vec::new();
        for link in links {
            if link.name != site_name {
                continue;
            }
            if let Some(record) = self.load(&link.case_id).await? {
                composed.push(self.compose(record).await);
            }
        }
        Ok(composed)
    }

    async fn remove_artifacts_and_record(&self, record: &CaseRecord) -> Result<(), ServiceError> {
        for task_id in [
            record.create_task_id.as_deref(),
            record.run_task_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            // Forgetting is best-effort; a broker that lost the handle must
            // not block removal.
            if let Err(err) = self.executor.forget(task_id).await {
                tracing::warn!(case_id = %record.id, task_id, error = %err, "failed to forget task handle");
            }
        }

        let folder_name = record.folder_name().to_owned();
        let _ = tokio::fs::remove_dir_all(self.config.cases_root.join(&folder_name)).await;
        for extension in ["zip", "tar.gz"] {
            let _ = tokio::fs::remove_file(
                self.config
                    .archives_root
                    .join(format!("{folder_name}.{extension}")),
            )
            .await;
        }
        if let Some(data_dir) = record.data_dir() {
            let _ = tokio::fs::remove_dir_all(data_dir).await;
        }
        tracing::info!(case_id = %record.id, "case artifacts removed");

        let id = record.id.clone();
        self.store_io(move |store| {
            store.unlink_case(&id)?;
            store.remove(&id).map(|_| ())
        })
        .await
    }

    async fn load(&self, case_id: &str) -> Result<Option<CaseRecord>, ServiceError> {
        let id = case_id.to_owned();
        self.store_io(move |store| store.get(&id)).await
    }

    async fn compose(&self, record: CaseRecord) -> CaseWithTaskInfo {
        reconcile::with_task_info(record, self.executor.as_ref()).await
    }

    async fn store_io<T: Send + 'static>(
        &self,
        op: impl FnOnce(&dyn CaseStore) -> Result<T, StoreError> + Send + 'static,
    ) -> Result<T, ServiceError> {
        let store = Arc::clone(&self.store);
        let joined = tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| ServiceError::Internal(format!("store worker join failed: {err}")))?;
        joined.map_err(ServiceError::from)
    }
}
