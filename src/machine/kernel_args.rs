//! Guest command-line encoding.
//!
//! Unikernel libraries read their parameters from the kernel command line
//! as `library.param=value` tokens separated by spaces. Application
//! arguments follow a literal `--`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Separator between library parameters and application arguments.
pub const APP_ARGS_SEPARATOR: &str = "--";

/// One `library.param=value` token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KernelArg {
    /// Library namespace (e.g. `netdev`).
    pub library: String,
    /// Parameter name, may itself contain dots.
    pub param: String,
    /// Value, passed through verbatim.
    pub value: String,
}

impl KernelArg {
    /// Build a token from its parts.
    pub fn new(
        library: impl Into<String>,
        param: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            library: library.into(),
            param: param.into(),
            value: value.into(),
        }
    }
}

impl FromStr for KernelArg {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::invalid_config(format!("invalid kernel argument '{}'", s));
        let (key, value) = s.split_once('=').ok_or_else(invalid)?;
        let (library, param) = key.split_once('.').ok_or_else(invalid)?;
        if library.is_empty() || param.is_empty() || key.contains(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(Self::new(library, param, value))
    }
}

impl std::fmt::Display for KernelArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}={}", self.library, self.param, self.value)
    }
}

impl TryFrom<String> for KernelArg {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<KernelArg> for String {
    fn from(arg: KernelArg) -> Self {
        arg.to_string()
    }
}

/// Encode the guest command line.
///
/// The separator is emitted only when there are application arguments.
pub fn encode(kernel_args: &[KernelArg], application_args: &[String]) -> String {
    let mut tokens: Vec<String> = kernel_args.iter().map(ToString::to_string).collect();
    if !application_args.is_empty() {
        tokens.push(APP_ARGS_SEPARATOR.to_string());
        tokens.extend(application_args.iter().cloned());
    }
    tokens.join(" ")
}
