use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pretty_assertions::assert_eq;
use serde_json::json;

use landcase_core::{
    CaseDefinition, CaseRecord, CaseStatus, CaseWithTaskInfo, DataReference, Driver, RawVariable,
    RegistryHandle, TaskStatus, TaskView,
};

use crate::executor::ExecutorFuture;
use crate::store::now_unix_millis;

use super::*;

#[derive(Debug)]
struct TempDir {
    root: PathBuf,
}

impl TempDir {
    fn new(prefix: &str) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("{prefix}_{now}"));
        fs::create_dir_all(&root).expect("create temp dir");
        Self { root }
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn definition(variables: Vec<RawVariable>) -> CaseDefinition {
    CaseDefinition {
        compset: "I2000Clm50Sp".to_owned(),
        resolution: Some("f19_g17".to_owned()),
        driver: Driver::Nuopc,
        data_reference: DataReference::Url("https://example/data.tar".to_owned()),
        variables,
        version_tag: "ctsm5.1".to_owned(),
        name: None,
    }
}

fn seed_record(id: &str, data_root: &Path) -> CaseRecord {
    CaseRecord::new(
        &definition(vec![]),
        vec![],
        id.to_owned(),
        id.to_owned(),
        data_root,
        now_unix_millis(),
    )
}

fn registry_handle(temp: &TempDir, document: serde_json::Value) -> Arc<RegistryHandle> {
    let config_dir = temp.root.join("config");
    fs::create_dir_all(&config_dir).expect("create config dir");
    let path = config_dir.join("variables_config.json");
    fs::write(&path, document.to_string()).expect("write registry doc");
    Arc::new(RegistryHandle::load(&path).expect("load registry"))
}

fn default_registry(temp: &TempDir) -> Arc<RegistryHandle> {
    registry_handle(
        temp,
        json!([
            {"name": "STOP_N", "category": "ctsm_xml", "type": "integer"},
            {"name": "hist_nhtfrq", "category": "user_nl_clm_history_file", "type": "integer"}
        ]),
    )
}

#[derive(Default, Debug)]
struct FakeExecutorState {
    submitted_create: Vec<CaseRecord>,
    submitted_run: Vec<CaseRecord>,
    forgotten: Vec<String>,
    poll_calls: Vec<String>,
    views: HashMap<String, TaskView>,
    next_task: u32,
}

#[derive(Clone)]
struct FakeTaskExecutor {
    state: Arc<Mutex<FakeExecutorState>>,
}

impl FakeTaskExecutor {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeExecutorState::default())),
        }
    }

    fn mint(&self, record: &CaseRecord, run: bool) -> String {
        let mut state = self.state.lock().expect("fake executor lock");
        state.next_task += 1;
        let task_id = format!("task_{}", state.next_task);
        state.views.insert(
            task_id.clone(),
            TaskView {
                task_id: Some(task_id.clone()),
                status: Some(TaskStatus::Pending),
                result: None,
                error: None,
            },
        );
        if run {
            state.submitted_run.push(record.clone());
        } else {
            state.submitted_create.push(record.clone());
        }
        task_id
    }
}

impl TaskExecutor for FakeTaskExecutor {
    fn submit_create<'a>(
        &'a self,
        record: &'a CaseRecord,
    ) -> ExecutorFuture<'a, Result<String, ServiceError>> {
        Box::pin(async move { Ok(self.mint(record, false)) })
    }

    fn submit_run<'a>(
        &'a self,
        record: &'a CaseRecord,
    ) -> ExecutorFuture<'a, Result<String, ServiceError>> {
        Box::pin(async move { Ok(self.mint(record, true)) })
    }

    fn poll<'a>(&'a self, task_id: &'a str) -> ExecutorFuture<'a, TaskView> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("fake executor lock");
            state.poll_calls.push(task_id.to_owned());
            state.views.get(task_id).cloned().unwrap_or(TaskView {
                task_id: Some(task_id.to_owned()),
                status: Some(TaskStatus::Pending),
                result: None,
                error: None,
            })
        })
    }

    fn forget<'a>(&'a self, task_id: &'a str) -> ExecutorFuture<'a, Result<(), ServiceError>> {
        Box::pin(async move {
            self.state
                .lock()
                .expect("fake executor lock")
                .forgotten
                .push(task_id.to_owned());
            Ok(())
        })
    }
}

struct Fixture {
    _temp: TempDir,
    service: CaseService,
    store: Arc<dyn CaseStore>,
    executor: FakeTaskExecutor,
    config: ServiceConfig,
}

fn fixture(prefix: &str) -> Fixture {
    let temp = TempDir::new(prefix);
    let registry = default_registry(&temp);
    let config = ServiceConfig::new(&temp.root, "ctsm5.1");
    let store: Arc<dyn CaseStore> = Arc::new(FsCaseStore::new(&config.records_root));
    let executor = FakeTaskExecutor::new();
    let service = CaseService::with_parts(
        config.clone(),
        registry,
        Arc::clone(&store),
        Arc::new(executor.clone()),
    );
    Fixture {
        _temp: temp,
        service,
        store,
        executor,
        config,
    }
}

// --- store behavior -------------------------------------------------------

#[test]
fn store_insert_is_unique_on_id() {
    let temp = TempDir::new("landcase_store_unique");
    let store = FsCaseStore::new(temp.root.join("records"));
    let record = seed_record("case_a", &temp.root.join("data"));

    store.insert_new(&record).expect("first insert wins");
    let err = store.insert_new(&record).expect_err("second insert loses");
    assert_eq!(err, StoreError::Conflict("case_a".to_owned()));
}

#[test]
fn store_rejects_backward_transitions() {
    let temp = TempDir::new("landcase_store_transitions");
    let store = FsCaseStore::new(temp.root.join("records"));
    let record = seed_record("case_b", &temp.root.join("data"));
    store.insert_new(&record).expect("insert");

    store
        .update_status("case_b", CaseStatus::Configured)
        .expect("forward transition");
    let err = store
        .update_status("case_b", CaseStatus::Created)
        .expect_err("backward transition must fail");
    assert_eq!(
        err,
        StoreError::IllegalTransition {
            id: "case_b".to_owned(),
            from: CaseStatus::Configured,
            to: CaseStatus::Created,
        }
    );

    // Failure is reachable from any live state and absorbing.
    store
        .update_status("case_b", CaseStatus::Failed)
        .expect("fail transition");
    assert!(store.update_status("case_b", CaseStatus::Building).is_err());
}

#[test]
fn store_round_trips_task_handles_and_removal() {
    let temp = TempDir::new("landcase_store_roundtrip");
    let store = FsCaseStore::new(temp.root.join("records"));
    let record = seed_record("case_c", &temp.root.join("data"));
    store.insert_new(&record).expect("insert");

    let updated = store
        .set_create_task("case_c", "task_9")
        .expect("set create task");
    assert_eq!(updated.create_task_id.as_deref(), Some("task_9"));

    let loaded = store.get("case_c").expect("get").expect("present");
    assert_eq!(loaded.create_task_id.as_deref(), Some("task_9"));

    let removed = store.remove("case_c").expect("remove");
    assert_eq!(removed.map(|r| r.id), Some("case_c".to_owned()));
    assert_eq!(store.get("case_c").expect("get"), None);
    assert_eq!(store.remove("case_c").expect("second remove"), None);
}

#[test]
fn store_site_links_round_trip() {
    let temp = TempDir::new("landcase_store_links");
    let store = FsCaseStore::new(temp.root.join("records"));

    store
        .link_site(&SiteLink::new("ALP1", "case_x"))
        .expect("link");
    store
        .link_site(&SiteLink::new("ALP1", "case_y"))
        .expect("second link");
    store
        .link_site(&SiteLink::new("ALP2", "case_x"))
        .expect("other site");
    assert_eq!(store.site_links().expect("links").len(), 3);

    store.unlink_case("case_x").expect("unlink case");
    let links = store.site_links().expect("links");
    assert_eq!(links, vec![SiteLink::new("ALP1", "case_y")]);
}

// --- service behavior over a fake executor --------------------------------

#[tokio::test(flavor = "current_thread")]
async fn create_dispatches_once_and_returns_a_live_view() {
    let fx = fixture("landcase_service_create");

    let view = fx
        .service
        .create_or_reuse(definition(vec![RawVariable::new("STOP_N", json!("3"))]))
        .await
        .expect("create");

    assert_eq!(view.case.id.len(), 32);
    assert_eq!(view.case.status, CaseStatus::Initialised);
    assert_eq!(view.create_task.task_id.as_deref(), Some("task_1"));
    assert_eq!(view.create_task.status, Some(TaskStatus::Pending));
    assert_eq!(view.run_task, TaskView::empty());

    let state = fx.executor.state.lock().expect("state");
    assert_eq!(state.submitted_create.len(), 1);
    // The validated variable reached the dispatched record, coerced.
    assert_eq!(state.submitted_create[0].variables[0].name, "STOP_N");
}

#[tokio::test(flavor = "current_thread")]
async fn identical_request_reuses_record_and_task_handle() {
    let fx = fixture("landcase_service_dedup");
    let def = definition(vec![]);

    let first = fx.service.create_or_reuse(def.clone()).await.expect("create");
    let second = fx.service.create_or_reuse(def).await.expect("reuse");

    assert_eq!(first.case.id, second.case.id);
    assert_eq!(
        first.create_task.task_id, second.create_task.task_id,
        "dedup must not mint a second task handle"
    );
    let state = fx.executor.state.lock().expect("state");
    assert_eq!(state.submitted_create.len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn empty_version_tag_falls_back_to_the_configured_model() {
    let fx = fixture("landcase_service_versiontag");
    let mut def = definition(vec![]);
    def.version_tag = String::new();

    let view = fx.service.create_or_reuse(def).await.expect("create");
    assert_eq!(view.case.version_tag, "ctsm5.1");
}

#[tokio::test(flavor = "current_thread")]
async fn variable_order_does_not_change_the_identity() {
    let fx = fixture("landcase_service_order");

    let forward = fx
        .service
        .create_or_reuse(definition(vec![
            RawVariable::new("STOP_N", json!(3)),
            RawVariable::new("hist_nhtfrq", json!(-24)),
        ]))
        .await
        .expect("create");
    let permuted = fx
        .service
        .create_or_reuse(definition(vec![
            RawVariable::new("hist_nhtfrq", json!(-24)),
            RawVariable::new("STOP_N", json!(3)),
        ]))
        .await
        .expect("reuse");

    assert_eq!(forward.case.id, permuted.case.id);
    let state = fx.executor.state.lock().expect("state");
    assert_eq!(state.submitted_create.len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn invalid_variables_reject_the_whole_request() {
    let fx = fixture("landcase_service_invalid");

    let err = fx
        .service
        .create_or_reuse(definition(vec![
            RawVariable::new("STOP_N", json!("abc")),
            RawVariable::new("NOT_A_VAR", json!(1)),
        ]))
        .await
        .expect_err("must reject");

    let ServiceError::Validation(validation) = err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(validation.errors.len(), 2);
    assert!(validation.errors.iter().any(|e| e.contains("STOP_N")));
    assert!(validation.errors.iter().any(|e| e.contains("NOT_A_VAR")));

    // Nothing was persisted or dispatched.
    assert!(fx.service.list_cases().await.expect("list").is_empty());
    assert!(fx
        .executor
        .state
        .lock()
        .expect("state")
        .submitted_create
        .is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn failed_case_is_recreated_under_the_same_id() {
    let fx = fixture("landcase_service_retry");
    let def = definition(vec![]);

    let first = fx.service.create_or_reuse(def.clone()).await.expect("create");
    let case_id = first.case.id.clone();
    let old_task = first.create_task.task_id.clone().expect("task handle");

    fx.store
        .update_status(&case_id, CaseStatus::Failed)
        .expect("mark failed");
    // Leftover case directory from the failed attempt.
    let case_dir = fx.config.cases_root.join(&case_id);
    fs::create_dir_all(&case_dir).expect("leftover dir");

    let second = fx.service.create_or_reuse(def).await.expect("recreate");

    assert_eq!(second.case.id, case_id, "identity survives recreation");
    assert_eq!(second.case.status, CaseStatus::Initialised);
    assert_ne!(
        second.create_task.task_id.as_deref(),
        Some(old_task.as_str()),
        "recreation resets the task handle"
    );
    assert_eq!(second.case.run_task_id, None);
    assert!(!case_dir.exists(), "old artifacts are removed");

    let state = fx.executor.state.lock().expect("state");
    assert_eq!(state.submitted_create.len(), 2);
    assert!(state.forgotten.contains(&old_task));
}

#[tokio::test(flavor = "current_thread")]
async fn run_sets_building_before_the_task_view_is_composed() {
    let fx = fixture("landcase_service_run");

    let created = fx
        .service
        .create_or_reuse(definition(vec![]))
        .await
        .expect("create");
    let view = fx
        .service
        .run_case(&created.case.id)
        .await
        .expect("run")
        .expect("case exists");

    assert_eq!(view.case.status, CaseStatus::Building);
    assert_eq!(view.run_task.task_id.as_deref(), Some("task_2"));

    let state = fx.executor.state.lock().expect("state");
    assert_eq!(state.submitted_run.len(), 1);
    assert_eq!(state.submitted_run[0].status, CaseStatus::Building);
}

#[tokio::test(flavor = "current_thread")]
async fn missing_case_reads_as_none_not_error() {
    let fx = fixture("landcase_service_missing");
    assert_eq!(fx.service.get_case("does_not_exist").await.expect("get"), None);
    assert_eq!(fx.service.run_case("does_not_exist").await.expect("run"), None);
    assert!(fx
        .service
        .remove_case("does_not_exist")
        .await
        .expect("remove")
        .is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn absent_handles_compose_empty_views_without_polling() {
    let fx = fixture("landcase_service_emptyviews");
    let record = seed_record("bare_case", &fx.config.data_root);
    fx.store.insert_new(&record).expect("insert");

    let view = fx
        .service
        .get_case("bare_case")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(view.create_task, TaskView::empty());
    assert_eq!(view.run_task, TaskView::empty());
    assert!(fx
        .executor
        .state
        .lock()
        .expect("state")
        .poll_calls
        .is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn remove_deletes_artifacts_and_forgets_handles() {
    let fx = fixture("landcase_service_remove");

    let created = fx
        .service
        .create_or_reuse(definition(vec![]))
        .await
        .expect("create");
    let case_id = created.case.id.clone();
    let task_id = created.create_task.task_id.clone().expect("task handle");

    let case_dir = fx.config.cases_root.join(&case_id);
    fs::create_dir_all(&case_dir).expect("case dir");
    fs::create_dir_all(fx.config.archives_root.clone()).expect("archives dir");
    let archive = fx.config.archives_root.join(format!("{case_id}.zip"));
    fs::write(&archive, b"zip").expect("archive file");
    let data_dir = fx.config.data_root.join(&case_id);
    fs::create_dir_all(&data_dir).expect("data dir");
    fx.service
        .link_site("ALP1", &case_id)
        .await
        .expect("link site");

    let removed = fx
        .service
        .remove_case(&case_id)
        .await
        .expect("remove")
        .expect("was present");
    assert_eq!(removed.id, case_id);

    assert!(!case_dir.exists());
    assert!(!archive.exists());
    assert!(!data_dir.exists());
    assert_eq!(fx.service.get_case(&case_id).await.expect("get"), None);
    assert!(fx.store.site_links().expect("links").is_empty());
    assert!(fx
        .executor
        .state
        .lock()
        .expect("state")
        .forgotten
        .contains(&task_id));
}

#[tokio::test(flavor = "current_thread")]
async fn site_links_resolve_and_skip_dangling_cases() {
    let fx = fixture("landcase_service_sites");

    let created = fx
        .service
        .create_or_reuse(definition(vec![]))
        .await
        .expect("create");
    fx.service
        .link_site("ALP1", &created.case.id)
        .await
        .expect("link");
    fx.store
        .link_site(&SiteLink::new("ALP1", "gone_case"))
        .expect("dangling link");

    let cases = fx.service.cases_for_site("ALP1").await.expect("resolve");
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].case.id, created.case.id);

    let err = fx
        .service
        .link_site("ALP1", "gone_case")
        .await
        .expect_err("linking a missing case fails");
    assert_eq!(err, ServiceError::UnknownCase("gone_case".to_owned()));
}

// --- end to end over the bundled executor and a fake toolchain -------------

const E2E_CREATE_NEWCASE: &str = r#"#!/bin/sh
CASE=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--case" ]; then
    CASE="$2"
  fi
  shift
done
mkdir -p "$CASE"
for s in case.setup case.build check_input_data case.submit xmlchange; do
  printf '#!/bin/sh\nexit 0\n' > "$CASE/$s"
  chmod +x "$CASE/$s"
done
"#;

fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create script dir");
    }
    fs::write(path, body).expect("write script");
    let mut permissions = fs::metadata(path).expect("script metadata").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions).expect("make script executable");
}

fn install_fake_toolchain(model_root: &Path) {
    write_script(
        &model_root.join("cime").join("scripts").join("create_newcase"),
        E2E_CREATE_NEWCASE,
    );
    for tool in ["modify_fates_paramfile.py", "FatesPFTIndexSwapper.py"] {
        write_script(
            &model_root
                .join("components")
                .join("clm")
                .join("src")
                .join("fates")
                .join("tools")
                .join(tool),
            "#!/bin/sh\nexit 0\n",
        );
    }
}

async fn wait_for(
    service: &CaseService,
    case_id: &str,
    pick: impl Fn(&CaseWithTaskInfo) -> TaskView,
) -> CaseWithTaskInfo {
    for _ in 0..200 {
        let view = service
            .get_case(case_id)
            .await
            .expect("get case")
            .expect("case present");
        match pick(&view).status {
            Some(TaskStatus::Success) => return view,
            Some(TaskStatus::Failure) => {
                panic!("task failed: {:?}", pick(&view).error)
            }
            _ => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    }
    panic!("task did not finish in time");
}

#[tokio::test(flavor = "current_thread")]
async fn full_lifecycle_runs_through_the_bundled_executor() {
    let temp = TempDir::new("landcase_service_e2e");
    let config = ServiceConfig::new(&temp.root, "ctsm5.1");
    install_fake_toolchain(&config.model_root);
    fs::create_dir_all(config.registry_path.parent().expect("config dir"))
        .expect("create config dir");
    fs::write(&config.registry_path, "[]").expect("write registry doc");

    let service = CaseService::new(config.clone()).expect("service boots");

    let created = service
        .create_or_reuse(definition(vec![]))
        .await
        .expect("create");
    let case_id = created.case.id.clone();
    assert_eq!(case_id.len(), 32);
    assert!(created.create_task.task_id.is_some());
    // The phase runs concurrently, so the immediate view may be anywhere
    // from INITIALISED to CONFIGURED, but never failed.
    assert_ne!(created.case.status, CaseStatus::Failed);
    assert!(created.create_task.status.is_some());

    let configured = wait_for(&service, &case_id, |view| view.create_task.clone()).await;
    assert_eq!(configured.case.status, CaseStatus::Configured);
    assert!(config.cases_root.join(&case_id).is_dir());

    let running = service
        .run_case(&case_id)
        .await
        .expect("run")
        .expect("case exists");
    assert!(running.run_task.task_id.is_some());

    let submitted = wait_for(&service, &case_id, |view| view.run_task.clone()).await;
    assert_eq!(submitted.case.status, CaseStatus::Submitted);

    let removed = service.remove_case(&case_id).await.expect("remove");
    assert!(removed.is_some());
    assert!(!config.cases_root.join(&case_id).exists());
    assert_eq!(service.get_case(&case_id).await.expect("get"), None);
}

#[tokio::test(flavor = "current_thread")]
async fn failing_toolchain_step_marks_the_case_failed_with_an_excerpt() {
    let temp = TempDir::new("landcase_service_e2e_fail");
    let config = ServiceConfig::new(&temp.root, "ctsm5.1");
    install_fake_toolchain(&config.model_root);
    // Creation itself fails: the script reports a multi-line error.
    write_script(
        &config.model_root.join("cime").join("scripts").join("create_newcase"),
        "#!/bin/sh\necho \"Traceback (most recent call last):\" >&2\necho \"RuntimeError: compset not supported\" >&2\nexit 1\n",
    );
    fs::create_dir_all(config.registry_path.parent().expect("config dir"))
        .expect("create config dir");
    fs::write(&config.registry_path, "[]").expect("write registry doc");

    let service = CaseService::new(config).expect("service boots");
    let created = service
        .create_or_reuse(definition(vec![]))
        .await
        .expect("create dispatches");
    let case_id = created.case.id.clone();

    for _ in 0..200 {
        let view = service
            .get_case(&case_id)
            .await
            .expect("get")
            .expect("present");
        if view.create_task.status == Some(TaskStatus::Failure) {
            assert_eq!(view.case.status, CaseStatus::Failed);
            let excerpt = view.create_task.error.expect("error excerpt");
            assert!(excerpt.contains("compset not supported"));
            assert!(!excerpt.contains("Traceback"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("creation never failed");
}
