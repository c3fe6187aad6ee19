//! Immutable description of a command to execute.

use crate::SpecError;
use crate::listener::SampleListener;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Time limit used when none is configured. Effectively unbounded.
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// An immutable command description.
///
/// Every `with_*` method consumes the spec and returns a new one.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tokio_command_probe::CommandSpec;
///
/// let spec = CommandSpec::new("build-42", ["sh", "-c", "echo hi; exit 3"])?
///     .with_successful_exit_codes([0, 3])?
///     .with_env("LC_ALL", "C")
///     .with_time_limit(Duration::from_secs(10));
///
/// assert_eq!(spec.id(), "build-42");
/// assert!(spec.successful_exit_codes().contains(&3));
/// # Ok::<_, tokio_command_probe::SpecError>(())
/// ```
#[derive(Clone)]
pub struct CommandSpec {
    id: String,
    argv: Vec<String>,
    directory: Option<PathBuf>,
    environment: BTreeMap<String, String>,
    inherit_environment: bool,
    successful_exit_codes: BTreeSet<i32>,
    time_limit: Duration,
    listeners: Vec<Arc<dyn SampleListener>>,
}

impl CommandSpec {
    /// Creates a spec running `argv` (program first) under the given run id.
    pub fn new<I, S>(id: impl Into<String>, argv: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SpecError::EmptyId);
        }
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        if argv.is_empty() {
            return Err(SpecError::EmptyCommand);
        }
        Ok(Self {
            id,
            argv,
            directory: None,
            environment: BTreeMap::new(),
            inherit_environment: true,
            successful_exit_codes: BTreeSet::from([0]),
            time_limit: DEFAULT_TIME_LIMIT,
            listeners: Vec::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The program followed by its arguments.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    /// The working directory. `None` runs the command in the current directory of this process.
    pub fn working_directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Whether the environment overlay is merged over the parent's environment (`true`) or
    /// replaces it (`false`).
    pub fn inherits_environment(&self) -> bool {
        self.inherit_environment
    }

    pub fn successful_exit_codes(&self) -> &BTreeSet<i32> {
        &self.successful_exit_codes
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    pub fn listeners(&self) -> &[Arc<dyn SampleListener>] {
        &self.listeners
    }

    /// Appends arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Adds (or overrides) one variable of the environment overlay.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Controls whether the parent's environment is passed on to the command.
    pub fn with_inherited_environment(mut self, inherit: bool) -> Self {
        self.inherit_environment = inherit;
        self
    }

    /// Replaces the set of exit codes considered successful.
    pub fn with_successful_exit_codes(
        mut self,
        codes: impl IntoIterator<Item = i32>,
    ) -> Result<Self, SpecError> {
        let codes: BTreeSet<i32> = codes.into_iter().collect();
        if codes.is_empty() {
            return Err(SpecError::NoSuccessfulExitCodes);
        }
        self.successful_exit_codes = codes;
        Ok(self)
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    /// Attaches a listener receiving every sample taken while the command runs.
    pub fn with_listener(mut self, listener: Arc<dyn SampleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Name used in logs: the program followed by its quoted arguments.
    ///
    /// Example: `sh "-c" "echo hi"`
    pub fn display_name(&self) -> Cow<'static, str> {
        let mut name = String::new();
        name.push_str(self.program());
        for arg in self.args() {
            name.push_str(" \"");
            name.push_str(arg);
            name.push('"');
        }
        name.into()
    }
}

impl Debug for CommandSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("id", &self.id)
            .field("argv", &self.argv)
            .field("directory", &self.directory)
            .field("environment", &self.environment)
            .field("inherit_environment", &self.inherit_environment)
            .field("successful_exit_codes", &self.successful_exit_codes)
            .field("time_limit", &self.time_limit)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatsSample;
    use assertr::prelude::*;

    #[test]
    fn defaults() {
        let spec = CommandSpec::new("run", ["ls"]).unwrap();

        assert_that(spec.successful_exit_codes().clone()).is_equal_to(BTreeSet::from([0]));
        assert_that(spec.time_limit()).is_equal_to(DEFAULT_TIME_LIMIT);
        assert_that(spec.inherits_environment()).is_true();
        assert_that(spec.working_directory()).is_none();
        assert_that(spec.listeners().is_empty()).is_true();
    }

    #[test]
    fn rejects_empty_id_and_command() {
        assert_that(CommandSpec::new("", ["ls"]).unwrap_err()).is_equal_to(SpecError::EmptyId);
        assert_that(CommandSpec::new("run", Vec::<String>::new()).unwrap_err())
            .is_equal_to(SpecError::EmptyCommand);
    }

    #[test]
    fn rejects_empty_successful_exit_codes() {
        let err = CommandSpec::new("run", ["ls"])
            .unwrap()
            .with_successful_exit_codes([])
            .unwrap_err();

        assert_that(err).is_equal_to(SpecError::NoSuccessfulExitCodes);
    }

    #[test]
    fn builder_produces_new_values() {
        let base = CommandSpec::new("run", ["ls"]).unwrap();
        let derived = base
            .clone()
            .with_args(["-la"])
            .with_env("FOO", "foo")
            .with_inherited_environment(false)
            .with_listener(Arc::new(|_sample: &StatsSample| {}));

        assert_that(base.argv().len()).is_equal_to(1);
        assert_that(base.environment().is_empty()).is_true();
        assert_that(derived.argv().len()).is_equal_to(2);
        assert_that(derived.environment().get("FOO").map(String::as_str)).is_equal_to(Some("foo"));
        assert_that(derived.inherits_environment()).is_false();
        assert_that(derived.listeners().len()).is_equal_to(1);
    }

    #[test]
    fn display_name_quotes_arguments() {
        let spec = CommandSpec::new("run", ["sh", "-c", "echo hi"]).unwrap();

        assert_that(spec.display_name().as_ref()).is_equal_to("sh \"-c\" \"echo hi\"");
    }
}
