//! Child command description.

use std::path::PathBuf;

/// Builder for the command a child process runs.
///
/// Provides a builder API similar to `std::process::Command`, restricted to
/// the options the runtime supports: program, arguments, working directory
/// and environment overrides.
///
/// # Examples
///
/// ```rust,no_run
/// # use pipelite::ChildCommand;
/// let cmd = ChildCommand::new("sort")
///     .arg("-u")
///     .env("LC_ALL", "C")
///     .working_dir("/tmp");
/// ```
#[derive(Clone, Debug)]
pub struct ChildCommand {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) working_dir: Option<PathBuf>,
}

impl ChildCommand {
    /// Create a new command.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: vec![],
            working_dir: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.env.push((key.into(), val.into()));
        self
    }

    /// Set the child's working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_args_and_env() {
        let cmd = ChildCommand::new("cat")
            .arg("-n")
            .args(["a", "b"])
            .env("K", "V")
            .env("K2", "V2");

        assert_eq!(cmd.program, "cat");
        assert_eq!(cmd.args, vec!["-n", "a", "b"]);
        assert_eq!(
            cmd.env,
            vec![
                ("K".to_string(), "V".to_string()),
                ("K2".to_string(), "V2".to_string())
            ]
        );
        assert!(cmd.working_dir.is_none());
    }

    #[test]
    fn working_dir_is_stored() {
        let cmd = ChildCommand::new("ls").working_dir("/tmp");
        assert_eq!(cmd.working_dir.as_deref(), Some(std::path::Path::new("/tmp")));
    }
}
