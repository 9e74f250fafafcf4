use std::path::{Path, PathBuf};

use crate::config::{JupyterConfig, ToolchainConfig};
use crate::error::{AgentError, Result};
use crate::indexer::is_excluded;
use crate::queue::ScriptKind;

/// What a job runs, resolved once after the claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTarget {
    Python { path: PathBuf, args: Vec<String> },
    /// Arguments are not supported for notebooks.
    Notebook { path: PathBuf },
}

impl JobTarget {
    pub fn new(kind: ScriptKind, path: PathBuf, args: Vec<String>) -> Self {
        match kind {
            ScriptKind::Python => JobTarget::Python { path, args },
            ScriptKind::Notebook => JobTarget::Notebook { path },
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            JobTarget::Python { path, .. } | JobTarget::Notebook { path } => path,
        }
    }

    pub fn kind(&self) -> ScriptKind {
        match self {
            JobTarget::Python { .. } => ScriptKind::Python,
            JobTarget::Notebook { .. } => ScriptKind::Notebook,
        }
    }

    /// Command for this target; notebook output lands in `log_dir`.
    pub fn command(&self, toolchain: &ToolchainConfig, log_dir: &Path) -> CommandSpec {
        let command = match self {
            JobTarget::Python { path, args } => python_command(&toolchain.python, path, args),
            JobTarget::Notebook { path } => notebook_command(&toolchain.jupyter, path, log_dir),
        };
        match self.path().parent() {
            Some(dir) => command.in_dir(dir),
            None => command,
        }
    }
}

/// A program and its argument vector. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-quoted rendering, for logs only.
    pub fn display(&self) -> String {
        let argv = self.argv();
        shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_else(|_| argv.join(" "))
    }

    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

pub fn python_command(interpreter: &str, path: &Path, args: &[String]) -> CommandSpec {
    let mut command = CommandSpec::new(interpreter).arg(path.to_string_lossy());
    command.args.extend(args.iter().cloned());
    command
}

/// Execute a notebook and write the executed copy to `output_dir/output.ipynb`.
pub fn notebook_command(jupyter: &str, path: &Path, output_dir: &Path) -> CommandSpec {
    CommandSpec::new(jupyter)
        .arg("nbconvert")
        .arg("--to")
        .arg("notebook")
        .arg("--execute")
        .arg(path.to_string_lossy())
        .arg("--output")
        .arg("output.ipynb")
        .arg("--output-dir")
        .arg(output_dir.to_string_lossy())
}

/// Notebook server bound to `config.ip:port` with token auth and no password.
pub fn session_command(jupyter: &str, config: &JupyterConfig, port: u16, token: &str) -> CommandSpec {
    let app = if config.legacy {
        "NotebookApp"
    } else {
        "ServerApp"
    };
    CommandSpec::new(jupyter)
        .arg("lab")
        .arg("--no-browser")
        .arg(format!("--port={}", port))
        .arg(format!("--ip={}", config.ip))
        .arg(format!("--{}.token={}", app, token))
        .arg(format!("--{}.password=", app))
}

/// Resolve a job's script path and check it is safe to run.
///
/// `raw` is relative to `home` or absolute. The canonical path must stay under
/// `home`, exist as a regular file, carry a `.py`/`.ipynb` suffix that agrees with
/// `expected` when given, and not sit inside an excluded directory.
pub fn confine_script(
    home: &Path,
    raw: &str,
    expected: Option<ScriptKind>,
) -> Result<(PathBuf, ScriptKind)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AgentError::Rejected("script path is empty".to_string()));
    }
    let home = home.canonicalize()?;
    let candidate = Path::new(raw);
    let full = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        home.join(candidate)
    };

    let resolved = full
        .canonicalize()
        .map_err(|_| AgentError::Rejected(format!("script not found: {}", full.display())))?;
    let Ok(relative) = resolved.strip_prefix(&home) else {
        return Err(AgentError::Rejected(format!(
            "{} is outside the home directory",
            resolved.display()
        )));
    };
    let Some(kind) = ScriptKind::from_path(&resolved) else {
        return Err(AgentError::Rejected(
            "only .py or .ipynb scripts are allowed".to_string(),
        ));
    };
    if let Some(expected) = expected.filter(|expected| *expected != kind) {
        return Err(AgentError::Rejected(format!(
            "script type mismatch: expected {}, found {}",
            expected, kind
        )));
    }
    if is_excluded(relative) {
        return Err(AgentError::Rejected(format!(
            "{} is under a skipped directory",
            resolved.display()
        )));
    }
    if !resolved.is_file() {
        return Err(AgentError::Rejected(format!(
            "{} is not a regular file",
            resolved.display()
        )));
    }
    Ok((resolved, kind))
}
