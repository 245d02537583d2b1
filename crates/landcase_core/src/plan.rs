use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::case::{CaseRecord, CaseStatus};
use crate::errors::PlanError;
use crate::registry::VariableRegistry;
use crate::variable::{
    CaseVariable, VariableCategory, VariableType, VariableValue, PFT_INDEX_VARIABLE,
};

/// Name of the vegetation parameter-file variable; when present its value
/// points at the parameter file, otherwise the file is discovered under the
/// shared input-data tree.
pub const FATES_PARAMFILE_VARIABLE: &str = "fates_paramfile";

/// Working directory of one step, resolved by the interpreter.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepCwd {
    /// Run from the service's own working directory (scripts invoked by
    /// absolute path).
    Root,
    /// Run inside the case directory.
    CaseDir,
}

/// One line destined for the case's namelist file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum NamelistEntry {
    Var {
        name: String,
        value: VariableValue,
        var_type: VariableType,
    },
    /// Passthrough text appended verbatim.
    Verbatim(String),
}

/// Where the run-phase parameter file comes from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FatesParamSource {
    /// Path resolved from the `fates_paramfile` variable.
    Variable(String),
    /// Discover a default file under the shared input-data tree and copy it
    /// into the case data root.
    Discover,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum StepOp {
    CreateCase,
    ApplyXmlChanges { changes: Vec<(String, String)> },
    CaseSetup,
    WriteNamelist { entries: Vec<NamelistEntry> },
    CaseBuild,
    CheckInputData,
    ResolveFatesParams { source: FatesParamSource },
    ModifyFatesParam {
        param: String,
        /// 1-based plant-functional-type index.
        pft_index: usize,
        value: String,
    },
    /// Reference the discovered parameter file from the namelist; only
    /// emitted for the discovery path, always followed by a rebuild.
    AppendFatesParamNamelist,
    SwapPftIndices { indices: Vec<i64> },
    CaseSubmit,
}

/// One lifecycle step: the operation, where it runs, and the status the
/// case reaches when the operation succeeds. The interpreter persists the
/// status after each step and stops the phase at the first failure.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaseStep {
    pub op: StepOp,
    pub cwd: StepCwd,
    pub resulting_status: CaseStatus,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CasePlan {
    pub steps: Vec<CaseStep>,
}

impl CasePlan {
    pub fn statuses(&self) -> Vec<CaseStatus> {
        self.steps.iter().map(|step| step.resulting_status).collect()
    }
}

/// Build the create-phase plan: case creation, batched XML changes (only
/// when XML-category variables are present), setup, then the namelist write
/// that closes the phase at `Configured`.
pub fn create_phase_plan(
    record: &CaseRecord,
    registry: &VariableRegistry,
) -> Result<CasePlan, PlanError> {
    let mut xml_changes = Vec::new();
    let mut namelist_entries = Vec::new();

    for variable in &record.variables {
        match variable.category {
            VariableCategory::Passthrough => {
                if let VariableValue::Str(text) = &variable.value {
                    namelist_entries.push(NamelistEntry::Verbatim(text.clone()));
                }
            }
            VariableCategory::CtsmXml => {
                let value = resolved_value_text(record, registry, variable)?;
                xml_changes.push((variable.name.clone(), value));
            }
            VariableCategory::UserNlClm | VariableCategory::UserNlClmHistoryFile => {
                let value = resolved_namelist_value(record, registry, variable)?;
                namelist_entries.push(NamelistEntry::Var {
                    name: variable.name.clone(),
                    value,
                    var_type: variable.var_type,
                });
            }
            // Vegetation variables only participate in the run phase.
            VariableCategory::Fates | VariableCategory::FatesParam => {}
        }
    }

    let mut steps = vec![CaseStep {
        op: StepOp::CreateCase,
        cwd: StepCwd::Root,
        resulting_status: CaseStatus::Created,
    }];
    if !xml_changes.is_empty() {
        steps.push(CaseStep {
            op: StepOp::ApplyXmlChanges {
                changes: xml_changes,
            },
            cwd: StepCwd::CaseDir,
            resulting_status: CaseStatus::Updated,
        });
    }
    steps.push(CaseStep {
        op: StepOp::CaseSetup,
        cwd: StepCwd::CaseDir,
        resulting_status: CaseStatus::Setup,
    });
    steps.push(CaseStep {
        op: StepOp::WriteNamelist {
            entries: namelist_entries,
        },
        cwd: StepCwd::CaseDir,
        resulting_status: CaseStatus::Configured,
    });

    Ok(CasePlan { steps })
}

/// Build the run-phase plan: build, input-data check, the conditional
/// vegetation branch (entered only when the index variable is present, one
/// parameter-edit step per scalar value, index remap last), then submit.
pub fn run_phase_plan(
    record: &CaseRecord,
    registry: &VariableRegistry,
) -> Result<CasePlan, PlanError> {
    let mut steps = vec![
        CaseStep {
            op: StepOp::CaseBuild,
            cwd: StepCwd::CaseDir,
            resulting_status: CaseStatus::Built,
        },
        CaseStep {
            op: StepOp::CheckInputData,
            cwd: StepCwd::CaseDir,
            resulting_status: CaseStatus::InputDataReady,
        },
    ];

    if let Some(pft_variable) = record
        .variables
        .iter()
        .find(|variable| variable.name == PFT_INDEX_VARIABLE)
    {
        let VariableValue::IntList(indices) = &pft_variable.value else {
            return Err(PlanError::InvalidValue {
                name: pft_variable.name.clone(),
                detail: "expected a list of integer indices".to_owned(),
            });
        };

        let source = match record
            .variables
            .iter()
            .find(|variable| variable.name == FATES_PARAMFILE_VARIABLE)
        {
            Some(paramfile) => {
                FatesParamSource::Variable(resolved_value_text(record, registry, paramfile)?)
            }
            None => FatesParamSource::Discover,
        };
        let discovery = source == FatesParamSource::Discover;
        steps.push(CaseStep {
            op: StepOp::ResolveFatesParams { source },
            cwd: StepCwd::Root,
            resulting_status: CaseStatus::InputDataReady,
        });

        let mut reached = CaseStatus::InputDataReady;
        for variable in &record.variables {
            if variable.category != VariableCategory::FatesParam {
                continue;
            }
            for (offset, scalar) in variable.value.scalars().iter().enumerate() {
                steps.push(CaseStep {
                    op: StepOp::ModifyFatesParam {
                        param: variable.name.clone(),
                        pft_index: offset + 1,
                        value: scalar.render_plain(),
                    },
                    cwd: StepCwd::Root,
                    resulting_status: CaseStatus::FatesParamsUpdated,
                });
                reached = CaseStatus::FatesParamsUpdated;
            }
        }

        if discovery {
            steps.push(CaseStep {
                op: StepOp::AppendFatesParamNamelist,
                cwd: StepCwd::CaseDir,
                resulting_status: reached,
            });
            // The namelist changed, so the case must be rebuilt.
            steps.push(CaseStep {
                op: StepOp::CaseBuild,
                cwd: StepCwd::CaseDir,
                resulting_status: CaseStatus::Rebuilt,
            });
        }

        steps.push(CaseStep {
            op: StepOp::SwapPftIndices {
                indices: indices.clone(),
            },
            cwd: StepCwd::Root,
            resulting_status: CaseStatus::FatesIndicesSet,
        });
    }

    steps.push(CaseStep {
        op: StepOp::CaseSubmit,
        cwd: StepCwd::CaseDir,
        resulting_status: CaseStatus::Submitted,
    });

    Ok(CasePlan { steps })
}

/// Plain-text value for command arguments, with the case-local data root
/// prefixed when the registry entry asks for it.
fn resolved_value_text(
    record: &CaseRecord,
    registry: &VariableRegistry,
    variable: &CaseVariable,
) -> Result<String, PlanError> {
    let config = registry
        .get(&variable.name)
        .ok_or_else(|| PlanError::UnsupportedVariable(variable.name.clone()))?;
    let text = variable.value.render_plain();
    if config.append_input_path {
        let data_dir = record.data_dir().unwrap_or("");
        return Ok(Path::new(data_dir).join(text).to_string_lossy().to_string());
    }
    Ok(text)
}

/// Namelist value, path-resolved when the registry entry asks for it.
fn resolved_namelist_value(
    record: &CaseRecord,
    registry: &VariableRegistry,
    variable: &CaseVariable,
) -> Result<VariableValue, PlanError> {
    let config = registry
        .get(&variable.name)
        .ok_or_else(|| PlanError::UnsupportedVariable(variable.name.clone()))?;
    if config.append_input_path {
        return Ok(VariableValue::Str(resolved_value_text(
            record, registry, variable,
        )?));
    }
    Ok(variable.value.clone())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::case::{CaseDefinition, DataReference, Driver};
    use crate::registry::VariableConfig;
    use crate::validate::{validate_variables, RawVariable};

    use super::*;

    fn registry() -> VariableRegistry {
        let configs: Vec<VariableConfig> = serde_json::from_value(json!([
            {"name": "STOP_N", "category": "ctsm_xml", "type": "integer"},
            {"name": "DATM_FILE", "category": "ctsm_xml", "type": "char",
             "append_input_path": true},
            {"name": "hist_nhtfrq", "category": "user_nl_clm_history_file", "type": "integer"},
            {"name": "included_pft_indices", "category": "fates", "type": "integer",
             "allow_multiple": true},
            {"name": "fates_paramfile", "category": "user_nl_clm", "type": "char",
             "append_input_path": true, "allow_custom": true},
            {"name": "fates_leaf_slatop", "category": "fates_param", "type": "float",
             "allow_multiple": true}
        ]))
        .expect("registry fixture");
        VariableRegistry::from_configs(configs)
    }

    fn record(raw: Vec<RawVariable>) -> CaseRecord {
        let registry = registry();
        let variables = validate_variables(&raw, &registry).expect("fixture variables");
        let definition = CaseDefinition {
            compset: "2000_DATM%1PTGSWP3_CLM50%FATES".to_owned(),
            resolution: None,
            driver: Driver::Mct,
            data_reference: DataReference::Url("https://example/data.tar".to_owned()),
            variables: raw,
            version_tag: "ctsm5.1".to_owned(),
            name: None,
        };
        CaseRecord::new(
            &definition,
            variables,
            "cafebabe".to_owned(),
            "cafebabe".to_owned(),
            Path::new("/srv/data"),
            0,
        )
    }

    fn ops(plan: &CasePlan) -> Vec<&StepOp> {
        plan.steps.iter().map(|step| &step.op).collect()
    }

    #[test]
    fn create_plan_without_xml_variables_skips_the_update_step() {
        let record = record(vec![]);
        let plan = create_phase_plan(&record, &registry()).expect("plan");
        assert_eq!(
            plan.statuses(),
            vec![CaseStatus::Created, CaseStatus::Setup, CaseStatus::Configured]
        );
        assert!(matches!(plan.steps[0].op, StepOp::CreateCase));
        assert!(matches!(
            plan.steps[2].op,
            StepOp::WriteNamelist { ref entries } if entries.is_empty()
        ));
    }

    #[test]
    fn create_plan_batches_xml_changes_and_resolves_paths() {
        let record = record(vec![
            RawVariable::new("STOP_N", json!(3)),
            RawVariable::new("DATM_FILE", json!("forcing/atm.nc")),
            RawVariable::new("hist_nhtfrq", json!(-24)),
            RawVariable::new("user_nl_clm_extra", json!("use_bedrock = .true.")),
        ]);
        let plan = create_phase_plan(&record, &registry()).expect("plan");
        assert_eq!(
            plan.statuses(),
            vec![
                CaseStatus::Created,
                CaseStatus::Updated,
                CaseStatus::Setup,
                CaseStatus::Configured
            ]
        );

        let StepOp::ApplyXmlChanges { changes } = &plan.steps[1].op else {
            panic!("expected xml change step, got {:?}", plan.steps[1].op);
        };
        assert_eq!(
            changes,
            &vec![
                (
                    "DATM_FILE".to_owned(),
                    "/srv/data/cafebabe/forcing/atm.nc".to_owned()
                ),
                ("STOP_N".to_owned(), "3".to_owned()),
            ]
        );

        let StepOp::WriteNamelist { entries } = &plan.steps[3].op else {
            panic!("expected namelist step");
        };
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], NamelistEntry::Var { ref name, .. } if name == "hist_nhtfrq"));
        assert!(matches!(
            entries[1],
            NamelistEntry::Verbatim(ref text) if text == "use_bedrock = .true."
        ));
    }

    #[test]
    fn run_plan_without_vegetation_branch_is_build_check_submit() {
        let record = record(vec![]);
        let plan = run_phase_plan(&record, &registry()).expect("plan");
        assert_eq!(
            plan.statuses(),
            vec![
                CaseStatus::Built,
                CaseStatus::InputDataReady,
                CaseStatus::Submitted
            ]
        );
    }

    #[test]
    fn run_plan_emits_one_parameter_step_per_scalar() {
        let record = record(vec![
            RawVariable::new("included_pft_indices", json!("1,2")),
            RawVariable::new("fates_paramfile", json!("fates_params.nc")),
            RawVariable::new("fates_leaf_slatop", json!([0.01, 0.02, 0.03])),
        ]);
        let plan = run_phase_plan(&record, &registry()).expect("plan");

        let param_steps: Vec<_> = plan
            .steps
            .iter()
            .filter_map(|step| match &step.op {
                StepOp::ModifyFatesParam {
                    param,
                    pft_index,
                    value,
                } => Some((param.as_str(), *pft_index, value.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(
            param_steps,
            vec![
                ("fates_leaf_slatop", 1, "0.01"),
                ("fates_leaf_slatop", 2, "0.02"),
                ("fates_leaf_slatop", 3, "0.03"),
            ]
        );

        // Parameter file comes from the variable: no discovery, no rebuild.
        assert!(plan.steps.iter().any(|step| matches!(
            &step.op,
            StepOp::ResolveFatesParams { source: FatesParamSource::Variable(path) }
                if path == "/srv/data/cafebabe/fates_params.nc"
        )));
        assert!(!plan
            .statuses()
            .contains(&CaseStatus::Rebuilt));

        // Index remap runs after parameter edits and before submit.
        let swap_position = plan
            .steps
            .iter()
            .position(|step| matches!(step.op, StepOp::SwapPftIndices { .. }))
            .expect("swap step");
        assert_eq!(
            plan.steps[swap_position].resulting_status,
            CaseStatus::FatesIndicesSet
        );
        assert!(matches!(
            plan.steps.last().map(|step| &step.op),
            Some(StepOp::CaseSubmit)
        ));
    }

    #[test]
    fn run_plan_discovery_path_rebuilds_the_case() {
        let record = record(vec![RawVariable::new("included_pft_indices", json!("3"))]);
        let plan = run_phase_plan(&record, &registry()).expect("plan");

        assert!(plan.steps.iter().any(|step| matches!(
            step.op,
            StepOp::ResolveFatesParams {
                source: FatesParamSource::Discover
            }
        )));
        assert!(plan
            .steps
            .iter()
            .any(|step| matches!(step.op, StepOp::AppendFatesParamNamelist)));
        assert!(plan.statuses().contains(&CaseStatus::Rebuilt));

        let build_count = ops(&plan)
            .iter()
            .filter(|op| matches!(op, StepOp::CaseBuild))
            .count();
        assert_eq!(build_count, 2);
    }

    #[test]
    fn run_plan_rejects_a_record_the_registry_no_longer_knows() {
        let mut record = record(vec![RawVariable::new("STOP_N", json!(1))]);
        record.variables[0].name = "RETIRED_VAR".to_owned();
        let err = create_phase_plan(&record, &registry()).expect_err("must fail");
        assert_eq!(err, PlanError::UnsupportedVariable("RETIRED_VAR".to_owned()));
    }
}
