pub mod case;
pub mod errors;
pub mod ident;
pub mod plan;
pub mod registry;
pub mod validate;
pub mod variable;

pub use case::{
    CaseDefinition, CaseRecord, CaseStatus, CaseWithTaskInfo, DataReference, Driver, TaskStatus,
    TaskView, ENV_CASE_DATA_ROOT, ENV_CASE_FOLDER_NAME,
};
pub use errors::{PlanError, RegistryError, ValidationError};
pub use ident::{case_folder_name, compute_case_id, slugify};
pub use plan::{
    create_phase_plan, run_phase_plan, CasePlan, CaseStep, FatesParamSource, NamelistEntry,
    StepCwd, StepOp, FATES_PARAMFILE_VARIABLE,
};
pub use registry::{
    ChoiceOption, RegistryHandle, VariableConfig, VariableRegistry, VariableValidation,
};
pub use validate::{validate_variables, RawVariable};
pub use variable::{
    coerce_scalar, CaseVariable, VariableCategory, VariableType, VariableValue,
    EXTRA_NAMELIST_VARIABLE, PFT_INDEX_VARIABLE,
};
