//! The compile-products manifest.
//!
//! One manifest is stored beside the artifacts of every compiled request.
//! It lists the products written for the request, the dependencies they
//! were built from, and whether the compile ended `Ready` or `Invalid`.

use crate::{
    depval::{DependentFileState, FileStatus},
    error::{AssetError, Result},
    keyed::{self, Item, KeyedWriter},
    AssetState,
};
use std::path::{Path, PathBuf};

const DOES_NOT_EXIST: &str = "doesnotexist";
const SHADOWED: &str = "shadowed";

/// One product recorded in a manifest: a chunk type and the file holding
/// the artifact for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileProduct {
    pub type_id: u64,
    pub artifact: PathBuf,
}

/// The parsed manifest of one compiled request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileProducts {
    /// Prefix dependencies are expressed relative to, when non-empty.
    pub base_path: PathBuf,
    pub state: AssetState,
    pub products: Vec<CompileProduct>,
    pub dependencies: Vec<DependentFileState>,
}

impl CompileProducts {
    pub fn new(state: AssetState) -> Self {
        Self {
            base_path: PathBuf::new(),
            state,
            products: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn find_product(&self, type_id: u64) -> Option<&CompileProduct> {
        self.products.iter().find(|p| p.type_id == type_id)
    }

    pub fn serialize(&self) -> String {
        let mut writer = KeyedWriter::new();
        writer.value("BasePath", &self.base_path.to_string_lossy());
        writer.value("Invalid", if self.state == AssetState::Ready { "0" } else { "1" });

        for product in &self.products {
            writer.begin_element(&product.type_id.to_string());
            writer.value("Artifact", &product.artifact.to_string_lossy());
            writer.end_element();
        }

        writer.begin_element("Dependencies");
        for dep in &self.dependencies {
            let path = dep.path.to_string_lossy();
            match dep.status {
                FileStatus::DoesNotExist => writer.value(&path, DOES_NOT_EXIST),
                FileStatus::Shadowed => writer.value(&path, SHADOWED),
                FileStatus::Normal => writer.value(&path, &dep.modification_time.to_string()),
            }
        }
        writer.end_element();
        writer.finish()
    }

    /// Parses a manifest document. `path` is only used to attribute
    /// errors.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let format_error = |message: String| AssetError::Format { path: path.to_path_buf(), message };
        let root = keyed::parse(text)
            .map_err(|err| format_error(err.to_string()))?;

        let mut result = CompileProducts::new(AssetState::Ready);
        for (key, item) in &root {
            match (key.as_str(), item) {
                ("BasePath", Item::Value(value)) => result.base_path = PathBuf::from(value),
                ("Invalid", Item::Value(value)) => {
                    result.state =
                        if value == "1" { AssetState::Invalid } else { AssetState::Ready };
                }
                ("Dependencies", Item::Element(children)) => {
                    for (dep_path, dep_item) in children {
                        let value = dep_item
                            .as_value()
                            .ok_or_else(|| format_error(format!(
                                "dependency \"{dep_path}\" is not an attribute"
                            )))?;
                        result.dependencies.push(parse_dependency(dep_path, value, &format_error)?);
                    }
                }
                (type_id, Item::Element(children)) => {
                    let type_id = type_id.parse::<u64>().map_err(|_| {
                        format_error(format!("unknown element \"{type_id}\""))
                    })?;
                    let artifact = keyed::find_value(children, "Artifact").ok_or_else(|| {
                        format_error(format!("product {type_id} has no Artifact attribute"))
                    })?;
                    result
                        .products
                        .push(CompileProduct { type_id, artifact: PathBuf::from(artifact) });
                }
                (key, Item::Value(_)) => {
                    return Err(format_error(format!("unknown attribute \"{key}\"")));
                }
            }
        }
        Ok(result)
    }
}

fn parse_dependency(
    path: &str,
    value: &str,
    format_error: &impl Fn(String) -> AssetError,
) -> Result<DependentFileState> {
    match value {
        DOES_NOT_EXIST => Ok(DependentFileState::missing(path)),
        SHADOWED => Ok(DependentFileState {
            path: PathBuf::from(path),
            modification_time: 0,
            status: FileStatus::Shadowed,
        }),
        time => {
            let modification_time = time.parse::<u64>().map_err(|_| {
                format_error(format!("bad modification time for dependency \"{path}\""))
            })?;
            Ok(DependentFileState::new(path, modification_time))
        }
    }
}
