use std::path::{Path, PathBuf};

use crate::ToolchainError;

/// Script names invoked inside a created case directory.
pub(crate) const CASE_SETUP: &str = "./case.setup";
pub(crate) const CASE_BUILD: &str = "./case.build";
pub(crate) const CASE_SUBMIT: &str = "./case.submit";
pub(crate) const XML_CHANGE: &str = "./xmlchange";
pub(crate) const CHECK_INPUT_DATA: &str = "./check_input_data";

/// Locations of the externally installed model toolchain scripts under a
/// single model root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolchainLayout {
    model_root: PathBuf,
}

impl ToolchainLayout {
    pub fn new(model_root: impl Into<PathBuf>) -> Self {
        Self {
            model_root: model_root.into(),
        }
    }

    pub fn model_root(&self) -> &Path {
        &self.model_root
    }

    pub fn create_newcase_script(&self) -> PathBuf {
        self.model_root.join("cime").join("scripts").join("create_newcase")
    }

    pub fn modify_fates_paramfile_script(&self) -> PathBuf {
        self.fates_tools_dir().join("modify_fates_paramfile.py")
    }

    pub fn pft_index_swapper_script(&self) -> PathBuf {
        self.fates_tools_dir().join("FatesPFTIndexSwapper.py")
    }

    fn fates_tools_dir(&self) -> PathBuf {
        self.model_root
            .join("components")
            .join("clm")
            .join("src")
            .join("fates")
            .join("tools")
    }

    /// Startup check: a missing or misconfigured toolchain installation is
    /// fatal before the service accepts requests, never a per-request error.
    pub fn verify_installation(&self) -> Result<(), ToolchainError> {
        for script in [
            self.create_newcase_script(),
            self.modify_fates_paramfile_script(),
            self.pft_index_swapper_script(),
        ] {
            if !script.is_file() {
                return Err(ToolchainError::MissingScript(
                    script.to_string_lossy().to_string(),
                ));
            }
        }
        Ok(())
    }
}
