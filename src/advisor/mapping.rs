//! Static mapping from test case names to suite definitions and executables.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading a test mapping.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MappingError {
    /// The mapping file could not be read.
    #[error("failed to read test mapping {path}: {message}")]
    Read {
        /// Mapping file path.
        path: Utf8PathBuf,
        /// Filesystem error.
        message: String,
    },
    /// The mapping file is not valid JSON of the expected shape.
    #[error("failed to parse test mapping {path}: {message}")]
    Parse {
        /// Mapping file path.
        path: Utf8PathBuf,
        /// Parser error.
        message: String,
    },
    /// The mapping lists no tests.
    #[error("test mapping {path} does not list any tests")]
    Empty {
        /// Mapping file path.
        path: Utf8PathBuf,
    },
    /// A required field is blank.
    #[error("test #{position} in the mapping has a blank `{field}`")]
    BlankField {
        /// One-based position of the entry.
        position: usize,
        /// Field name as written in the file.
        field: &'static str,
    },
    /// Two entries share a name.
    #[error("test `{name}` appears more than once in the mapping")]
    DuplicateName {
        /// Duplicated name.
        name: String,
    },
}

/// Shadow baseline pushed before the suite starts.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ShadowBaseline {
    /// Shadow property name.
    pub property: String,
    /// Value written to both the desired and reported sections.
    pub value: String,
}

/// One test case of the mapping.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    /// Name used to select the test.
    pub name: String,
    /// Remote suite definition identifier.
    pub suite_definition_id: String,
    /// Executable path relative to the build directory.
    pub executable: String,
    /// MQTT topic handed to the executable.
    #[serde(default)]
    pub topic: Option<String>,
    /// Shadow baseline for shadow tests.
    #[serde(default)]
    pub shadow: Option<ShadowBaseline>,
}

/// Ordered, validated set of test cases.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TestMapping {
    tests: Vec<TestCase>,
}

impl TestMapping {
    /// Reads and validates a mapping file.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] when the file cannot be read, parsed or
    /// validated.
    pub fn load(path: &Utf8Path) -> Result<Self, MappingError> {
        let contents = read_mapping(path)?;
        Self::from_json(path, &contents)
    }

    /// Parses and validates mapping JSON; `path` is only used in errors.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] when the JSON is malformed or invalid.
    pub fn from_json(path: &Utf8Path, contents: &str) -> Result<Self, MappingError> {
        let mapping: Self = serde_json::from_str(contents).map_err(|err| MappingError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        mapping.validate(path)?;
        Ok(mapping)
    }

    /// Builds a mapping from already constructed test cases.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] when validation fails.
    pub fn from_tests(tests: Vec<TestCase>) -> Result<Self, MappingError> {
        let mapping = Self { tests };
        mapping.validate(Utf8Path::new("<inline>"))?;
        Ok(mapping)
    }

    /// Test cases in file order.
    #[must_use]
    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    /// Looks a test case up by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&TestCase> {
        self.tests.iter().find(|test| test.name == name)
    }

    fn validate(&self, path: &Utf8Path) -> Result<(), MappingError> {
        if self.tests.is_empty() {
            return Err(MappingError::Empty {
                path: path.to_path_buf(),
            });
        }

        let mut seen = BTreeSet::new();
        for (index, test) in self.tests.iter().enumerate() {
            let position = index + 1;
            let required = [
                ("name", test.name.as_str()),
                ("suite_definition_id", test.suite_definition_id.as_str()),
                ("executable", test.executable.as_str()),
            ];
            if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
                return Err(MappingError::BlankField { position, field });
            }
            if let Some(shadow) = &test.shadow
                && shadow.property.trim().is_empty()
            {
                return Err(MappingError::BlankField {
                    position,
                    field: "shadow.property",
                });
            }
            if !seen.insert(test.name.as_str()) {
                return Err(MappingError::DuplicateName {
                    name: test.name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn read_mapping(path: &Utf8Path) -> Result<String, MappingError> {
    let read_error = |message: String| MappingError::Read {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| read_error(String::from("path has no file name")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| read_error(err.to_string()))?;
    dir.read_to_string(file_name)
        .map_err(|err| read_error(err.to_string()))
}
