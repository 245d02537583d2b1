use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::AsyncWriteExt;

use landcase_core::{
    CasePlan, CaseRecord, CaseStatus, CaseStep, FatesParamSource, StepCwd, StepOp,
};

use crate::command::{run_command, CommandSpec};
use crate::install::{
    ToolchainLayout, CASE_BUILD, CASE_SETUP, CASE_SUBMIT, CHECK_INPUT_DATA, XML_CHANGE,
};
use crate::namelist::render_namelist_entry;
use crate::ToolchainError;

const USER_NL_FILE: &str = "user_nl_clm";
const FATES_PARAM_FILE_PREFIX: &str = "fates_params_api";

pub type ToolchainFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persists the status reached after each successful step. Implemented by
/// the service layer over its case store; step execution does not continue
/// until the status write lands (crash-safe incremental progress).
pub trait StatusSink: Send + Sync {
    fn record_status<'a>(
        &'a self,
        case_id: &'a str,
        status: CaseStatus,
    ) -> ToolchainFuture<'a, Result<(), ToolchainError>>;
}

/// Interprets a `CasePlan` against the installed toolchain, strictly
/// sequentially for a single case. The first failing step aborts the
/// remainder of the phase; completed steps are never rolled back.
pub struct PlanExecutor {
    layout: ToolchainLayout,
    machine_name: String,
    cases_root: PathBuf,
    shared_data_root: PathBuf,
}

#[derive(Default)]
struct FatesParamState {
    path: Option<PathBuf>,
    discovered_file_name: Option<String>,
}

impl PlanExecutor {
    pub fn new(
        layout: ToolchainLayout,
        machine_name: impl Into<String>,
        cases_root: impl Into<PathBuf>,
        shared_data_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            layout,
            machine_name: machine_name.into(),
            cases_root: cases_root.into(),
            shared_data_root: shared_data_root.into(),
        }
    }

    pub fn case_path(&self, record: &CaseRecord) -> PathBuf {
        self.cases_root.join(record.folder_name())
    }

    /// Execute every step of the plan in order, persisting the resulting
    /// status through `sink` after each success.
    pub async fn execute_plan(
        &self,
        record: &CaseRecord,
        plan: &CasePlan,
        sink: &dyn StatusSink,
    ) -> Result<(), ToolchainError> {
        let case_path = self.case_path(record);
        let mut fates = FatesParamState::default();

        for step in &plan.steps {
            self.execute_step(record, &case_path, step, &mut fates)
                .await?;
            sink.record_status(&record.id, step.resulting_status)
                .await?;
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        record: &CaseRecord,
        case_path: &Path,
        step: &CaseStep,
        fates: &mut FatesParamState,
    ) -> Result<(), ToolchainError> {
        let cwd = match step.cwd {
            StepCwd::Root => None,
            StepCwd::CaseDir => Some(case_path.to_path_buf()),
        };

        match &step.op {
            StepOp::CreateCase => {
                // A half-created directory from an earlier failed attempt
                // must not confuse the creation script.
                let _ = tokio::fs::remove_dir_all(case_path).await;
                self.run_create_case(record, case_path).await
            }
            StepOp::ApplyXmlChanges { changes } => {
                let joined = changes
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join(",");
                let mut spec = CommandSpec::new(XML_CHANGE);
                spec.args = vec![joined];
                spec.cwd = cwd;
                spec.env = record.env.clone();
                run_command(&spec).await.map(|_| ())
            }
            StepOp::CaseSetup => self.run_case_script(record, CASE_SETUP, &[], cwd).await,
            StepOp::WriteNamelist { entries } => {
                if entries.is_empty() {
                    return Ok(());
                }
                let lines: Vec<String> = entries.iter().map(render_namelist_entry).collect();
                append_lines(&case_path.join(USER_NL_FILE), &lines).await
            }
            StepOp::CaseBuild => self.run_case_script(record, CASE_BUILD, &[], cwd).await,
            StepOp::CheckInputData => {
                self.run_case_script(record, CHECK_INPUT_DATA, &["--download"], cwd)
                    .await
            }
            StepOp::ResolveFatesParams { source } => {
                self.resolve_fates_params(record, source, fates).await
            }
            StepOp::AppendFatesParamNamelist => {
                let file_name = fates.discovered_file_name.as_deref().ok_or_else(|| {
                    ToolchainError::Internal(
                        "namelist reference requested before parameter-file discovery".to_owned(),
                    )
                })?;
                let line = format!("fates_paramfile = '$CLM_USRDAT_DIR/{file_name}'");
                append_lines(&case_path.join(USER_NL_FILE), &[line]).await
            }
            StepOp::ModifyFatesParam {
                param,
                pft_index,
                value,
            } => {
                let param_path = fates_param_path(fates)?;
                let mut spec = CommandSpec::new(self.layout.modify_fates_paramfile_script());
                spec.args = vec![
                    "--fin".to_owned(),
                    param_path.clone(),
                    "--fout".to_owned(),
                    param_path,
                    "--O".to_owned(),
                    "--pft".to_owned(),
                    pft_index.to_string(),
                    "--var".to_owned(),
                    param.clone(),
                    "--value".to_owned(),
                    value.clone(),
                ];
                spec.cwd = cwd;
                spec.env = record.env.clone();
                run_command(&spec).await.map(|_| ())
            }
            StepOp::SwapPftIndices { indices } => {
                let param_path = PathBuf::from(fates_param_path(fates)?);
                let swapped = temp_path_for(&param_path);
                let joined = indices
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                let mut spec = CommandSpec::new(self.layout.pft_index_swapper_script());
                spec.args = vec![
                    "--pft-indices".to_owned(),
                    joined,
                    "--fin".to_owned(),
                    param_path.to_string_lossy().to_string(),
                    "--fout".to_owned(),
                    swapped.to_string_lossy().to_string(),
                ];
                spec.cwd = cwd;
                spec.env = record.env.clone();
                run_command(&spec).await?;
                tokio::fs::rename(&swapped, &param_path)
                    .await
                    .map_err(|err| {
                        ToolchainError::Io(format!("replace parameter file failed: {err}"))
                    })
            }
            StepOp::CaseSubmit => self.run_case_script(record, CASE_SUBMIT, &[], cwd).await,
        }
    }

    async fn run_create_case(
        &self,
        record: &CaseRecord,
        case_path: &Path,
    ) -> Result<(), ToolchainError> {
        let resolution = record.resolution.as_deref().unwrap_or("CLM_USRDAT");
        let mut spec = CommandSpec::new(self.layout.create_newcase_script());
        spec.args = vec![
            "--case".to_owned(),
            case_path.to_string_lossy().to_string(),
            "--compset".to_owned(),
            record.compset.clone(),
            "--driver".to_owned(),
            record.driver.to_string(),
            "--res".to_owned(),
            resolution.to_owned(),
            "--machine".to_owned(),
            self.machine_name.clone(),
            "--run-unsupported".to_owned(),
            "--handle-preexisting-dirs".to_owned(),
            "r".to_owned(),
        ];

        if let Some(data_dir) = record.data_dir() {
            let user_mods = Path::new(data_dir).join("user_mods");
            if user_mods.is_dir() {
                spec.args.push("--user-mods-dirs".to_owned());
                spec.args.push(user_mods.to_string_lossy().to_string());
            }
        }

        spec.env = record.env.clone();
        run_command(&spec).await.map(|_| ())
    }

    async fn run_case_script(
        &self,
        record: &CaseRecord,
        script: &str,
        args: &[&str],
        cwd: Option<PathBuf>,
    ) -> Result<(), ToolchainError> {
        let mut spec = CommandSpec::new(script);
        spec.args = args.iter().map(|a| (*a).to_owned()).collect();
        spec.cwd = cwd;
        spec.env = record.env.clone();
        run_command(&spec).await.map(|_| ())
    }

    /// Point the interpreter at the run's parameter file: either the path a
    /// variable supplied, or the first default file found under the shared
    /// input-data tree, copied into the case data root.
    async fn resolve_fates_params(
        &self,
        record: &CaseRecord,
        source: &FatesParamSource,
        fates: &mut FatesParamState,
    ) -> Result<(), ToolchainError> {
        match source {
            FatesParamSource::Variable(path) => {
                fates.path = Some(PathBuf::from(path));
                Ok(())
            }
            FatesParamSource::Discover => {
                let mut found: Vec<PathBuf> = walkdir::WalkDir::new(&self.shared_data_root)
                    .into_iter()
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_type().is_file())
                    .filter(|entry| {
                        entry
                            .file_name()
                            .to_string_lossy()
                            .starts_with(FATES_PARAM_FILE_PREFIX)
                    })
                    .map(|entry| entry.into_path())
                    .collect();
                found.sort();

                let Some(source_path) = found.first() else {
                    return Err(ToolchainError::ParamFileNotFound);
                };
                if found.len() > 1 {
                    tracing::warn!(
                        count = found.len(),
                        using = %source_path.display(),
                        "multiple vegetation parameter files found, using the first"
                    );
                }

                let file_name = source_path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .ok_or_else(|| {
                        ToolchainError::Internal("parameter file has no file name".to_owned())
                    })?;
                let data_dir = PathBuf::from(record.data_dir().unwrap_or_default());
                tokio::fs::create_dir_all(&data_dir).await.map_err(|err| {
                    ToolchainError::Io(format!("create case data dir failed: {err}"))
                })?;
                let target = data_dir.join(&file_name);
                tokio::fs::copy(source_path, &target).await.map_err(|err| {
                    ToolchainError::Io(format!("copy parameter file failed: {err}"))
                })?;

                fates.path = Some(target);
                fates.discovered_file_name = Some(file_name);
                Ok(())
            }
        }
    }
}

fn fates_param_path(fates: &FatesParamState) -> Result<String, ToolchainError> {
    fates
        .path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string())
        .ok_or_else(|| {
            ToolchainError::Internal(
                "parameter edit requested before parameter-file resolution".to_owned(),
            )
        })
}

async fn append_lines(path: &Path, lines: &[String]) -> Result<(), ToolchainError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| ToolchainError::Io(format!("open namelist failed: {err}")))?;
    for line in lines {
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| ToolchainError::Io(format!("append namelist failed: {err}")))?;
        file.write_all(b"\n")
            .await
            .map_err(|err| ToolchainError::Io(format!("append namelist failed: {err}")))?;
    }
    file.flush()
        .await
        .map_err(|err| ToolchainError::Io(format!("flush namelist failed: {err}")))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("params");
    path.with_file_name(format!("{name}.tmp-{}", std::process::id()))
}
