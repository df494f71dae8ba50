//! Generic invocation controller for external ensemble-generation
//! tools.
//!
//! Every wrapped tool goes through the same lifecycle: resolve and
//! validate its properties against a declarative schema, short-circuit
//! when restart mode finds valid prior outputs, stage inputs into a
//! fresh working directory, build the argument vector, execute (as a
//! subprocess or an in-process computation), relocate the produced
//! artifacts to the caller's paths, and clean up. The per-tool
//! definitions live in [`tools`]; this module is the engine they all
//! share.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;
use serde_json::Value;

use flexdyn_core::{
    copy_into, create_unique_dir, is_non_empty_file, relocate_atomic, remove_dir_best_effort,
    Error, Result,
};

pub mod tools;

pub use tools::{
    anm_ensemble, concoord_disco, concoord_dist, imod_imc, imod_imode, imod_imove, nolb_nma,
};

/// Raw user-supplied property mapping, as read from a config file.
pub type Properties = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl PropValue {
    /// Uniform truthiness policy across all tools: a falsy value means
    /// "do not pass the flag at all", deferring to the wrapped
    /// binary's internal default.
    pub fn is_truthy(&self) -> bool {
        match self {
            PropValue::Int(v) => *v != 0,
            PropValue::Float(v) => *v != 0.0,
            PropValue::Bool(v) => *v,
            PropValue::Text(v) => !v.is_empty(),
        }
    }

    /// Render as a command-line token. Floats keep a decimal point so
    /// the token matches what the wrapped tools parse ("5.0", not "5").
    pub fn render(&self) -> String {
        match self {
            PropValue::Int(v) => v.to_string(),
            PropValue::Float(v) => {
                if v.fract() == 0.0 {
                    format!("{:.1}", v)
                } else {
                    format!("{}", v)
                }
            }
            PropValue::Bool(v) => v.to_string(),
            PropValue::Text(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    Int,
    Float,
    Bool,
    Text,
}

/// Range/enumeration constraint imposed by the wrapped tool.
#[derive(Debug, Clone, Copy)]
pub enum Constraint {
    Free,
    IntRange(i64, i64),
    MinInt(i64),
    FloatMin(f64),
    FloatPositive,
}

/// One entry of a tool's property schema. `default: None` means the
/// property stays unset unless the caller provides it (the wrapped
/// binary then applies its own default).
pub struct PropDef {
    pub key: &'static str,
    pub kind: PropKind,
    pub default: Option<PropValue>,
    pub constraint: Constraint,
}

impl PropDef {
    pub const fn new(
        key: &'static str,
        kind: PropKind,
        default: Option<PropValue>,
        constraint: Constraint,
    ) -> Self {
        PropDef {
            key,
            kind,
            default,
            constraint,
        }
    }
}

/// Workflow properties every tool accepts in addition to its schema.
const WORKFLOW_KEYS: &[&str] = &["remove_tmp", "restart"];

/// Fully resolved configuration: every recognized key has either a
/// concrete value or is knowingly unset.
#[derive(Debug)]
pub struct ResolvedProps {
    values: BTreeMap<&'static str, PropValue>,
    pub remove_tmp: bool,
    pub restart: bool,
}

impl ResolvedProps {
    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.values.get(key)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(PropValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(PropValue::Float(v)) => Some(*v),
            Some(PropValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(PropValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(PropValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }
}

fn coerce_value(tool: &str, def: &PropDef, raw: &Value) -> Result<PropValue> {
    let mismatch = |expected: &str| {
        Error::config(format!(
            "{}: property '{}' must be {} (got {})",
            tool, def.key, expected, raw
        ))
    };
    match def.kind {
        PropKind::Int => raw
            .as_i64()
            .map(PropValue::Int)
            .ok_or_else(|| mismatch("an integer")),
        PropKind::Float => raw
            .as_f64()
            .map(PropValue::Float)
            .ok_or_else(|| mismatch("a number")),
        PropKind::Bool => raw
            .as_bool()
            .map(PropValue::Bool)
            .ok_or_else(|| mismatch("a boolean")),
        PropKind::Text => raw
            .as_str()
            .map(|s| PropValue::Text(s.to_string()))
            .ok_or_else(|| mismatch("a string")),
    }
}

fn check_constraint(tool: &str, def: &PropDef, value: &PropValue) -> Result<()> {
    let out_of_range = |detail: String| {
        Error::config(format!(
            "{}: property '{}' out of range: {}",
            tool, def.key, detail
        ))
    };
    match (def.constraint, value) {
        (Constraint::Free, _) => Ok(()),
        (Constraint::IntRange(lo, hi), PropValue::Int(v)) => {
            if *v < lo || *v > hi {
                Err(out_of_range(format!("{} not in {}..={}", v, lo, hi)))
            } else {
                Ok(())
            }
        }
        (Constraint::MinInt(lo), PropValue::Int(v)) => {
            if *v < lo {
                Err(out_of_range(format!("{} below minimum {}", v, lo)))
            } else {
                Ok(())
            }
        }
        (Constraint::FloatMin(lo), PropValue::Float(v)) => {
            if *v < lo {
                Err(out_of_range(format!("{} below minimum {}", v, lo)))
            } else {
                Ok(())
            }
        }
        (Constraint::FloatPositive, PropValue::Float(v)) => {
            if *v <= 0.0 {
                Err(out_of_range(format!("{} must be positive", v)))
            } else {
                Ok(())
            }
        }
        // Int supplied where a float constraint applies: check the
        // numeric value, the kind coercion already accepted it.
        (Constraint::FloatMin(lo), PropValue::Int(v)) => {
            if (*v as f64) < lo {
                Err(out_of_range(format!("{} below minimum {}", v, lo)))
            } else {
                Ok(())
            }
        }
        (Constraint::FloatPositive, PropValue::Int(v)) => {
            if *v <= 0 {
                Err(out_of_range(format!("{} must be positive", v)))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

/// Pure, deterministic resolution of a raw property mapping against a
/// tool schema. Unrecognized keys are rejected by name; recognized
/// keys are type-coerced and range-checked; missing keys fall back to
/// the schema default when one exists.
pub fn resolve_properties(
    tool: &str,
    schema: &'static [PropDef],
    raw: &Properties,
) -> Result<ResolvedProps> {
    for key in raw.keys() {
        let known = WORKFLOW_KEYS.contains(&key.as_str())
            || schema.iter().any(|def| def.key == key.as_str());
        if !known {
            return Err(Error::config(format!(
                "{}: unrecognized property '{}'",
                tool, key
            )));
        }
    }

    let mut values = BTreeMap::new();
    for def in schema {
        let value = match raw.get(def.key) {
            Some(v) => Some(coerce_value(tool, def, v)?),
            None => def.default.clone(),
        };
        if let Some(value) = value {
            check_constraint(tool, def, &value)?;
            values.insert(def.key, value);
        }
    }

    let workflow_bool = |key: &str, fallback: bool| -> Result<bool> {
        match raw.get(key) {
            None => Ok(fallback),
            Some(v) => v.as_bool().ok_or_else(|| {
                Error::config(format!("{}: property '{}' must be a boolean", tool, key))
            }),
        }
    };

    Ok(ResolvedProps {
        values,
        remove_tmp: workflow_bool("remove_tmp", true)?,
        restart: workflow_bool("restart", false)?,
    })
}

/// Optional-flag table entry: emitted only when the property resolves
/// truthy.
pub struct FlagSpec {
    pub key: &'static str,
    pub flag: &'static str,
    pub takes_value: bool,
}

impl FlagSpec {
    pub const fn valued(key: &'static str, flag: &'static str) -> Self {
        FlagSpec {
            key,
            flag,
            takes_value: true,
        }
    }

    pub const fn bare(key: &'static str, flag: &'static str) -> Self {
        FlagSpec {
            key,
            flag,
            takes_value: false,
        }
    }
}

/// Append optional flags in table order. Falsy or unset properties
/// contribute neither flag nor value.
pub fn push_optional_flags(argv: &mut Vec<String>, props: &ResolvedProps, table: &[FlagSpec]) {
    for entry in table {
        if let Some(value) = props.get(entry.key) {
            if value.is_truthy() {
                argv.push(entry.flag.to_string());
                if entry.takes_value {
                    argv.push(value.render());
                }
            }
        }
    }
}

/// Per-tool choice of how inputs are placed into the working
/// directory and how path arguments are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingMode {
    /// Inputs copied in; arguments are paths relative to the
    /// directory.
    Relative,
    /// Inputs copied in by basename only and every file argument must
    /// be a bare filename. The iMODS binaries hold path arguments in
    /// fixed-size buffers and corrupt memory on long absolute paths
    /// (seen under deep container mounts), so short names are a
    /// correctness requirement here.
    Sandbox,
}

/// A declared input file with its accepted extensions.
pub struct InputFile {
    pub role: &'static str,
    pub source: PathBuf,
    pub accepted: &'static [&'static str],
}

/// A declared output destination with its accepted extensions.
pub struct OutputFile {
    pub role: &'static str,
    pub dest: PathBuf,
    pub accepted: &'static [&'static str],
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn check_extension(tool: &str, role: &str, path: &Path, accepted: &[&str]) -> Result<()> {
    if accepted.is_empty() {
        return Ok(());
    }
    let ext = extension_of(path);
    if accepted.contains(&ext.as_str()) {
        Ok(())
    } else {
        Err(Error::config(format!(
            "{}: {} '{}' must have one of the extensions {:?}",
            tool,
            role,
            path.display(),
            accepted
        )))
    }
}

/// The staged view of an invocation: the working directory plus the
/// workdir-relative names every argument must use.
pub struct Staged {
    pub dir: PathBuf,
    inputs: BTreeMap<&'static str, String>,
    outputs: BTreeMap<&'static str, String>,
}

impl Staged {
    /// Workdir-relative name of a staged input.
    pub fn input(&self, role: &str) -> &str {
        self.inputs
            .get(role)
            .map(|s| s.as_str())
            .unwrap_or_default()
    }

    /// Workdir-relative name planned for an output.
    pub fn output(&self, role: &str) -> &str {
        self.outputs
            .get(role)
            .map(|s| s.as_str())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn fake(
        dir: PathBuf,
        inputs: &[(&'static str, &str)],
        outputs: &[(&'static str, &str)],
    ) -> Self {
        Staged {
            dir,
            inputs: inputs
                .iter()
                .map(|(role, name)| (*role, name.to_string()))
                .collect(),
            outputs: outputs
                .iter()
                .map(|(role, name)| (*role, name.to_string()))
                .collect(),
        }
    }
}

/// What actually runs once staging is complete.
pub enum Computation {
    /// `argv[0]` is the binary; the rest are tokens referencing only
    /// workdir-relative paths. The process runs with the working
    /// directory as its cwd. `stdin_feed` answers interactive prompts.
    Subprocess {
        argv: Vec<String>,
        stdin_feed: Option<String>,
    },
    /// An in-process computation operating on staged paths inside the
    /// working directory. Shares the whole staging/relocation/cleanup
    /// protocol with the subprocess variant.
    InProcess(Box<dyn FnOnce(&Staged) -> Result<()>>),
}

/// Maps a tool-imposed artifact name inside the working directory to
/// the declared output role it satisfies.
#[derive(Debug)]
pub struct Artifact {
    pub staged_name: String,
    pub role: &'static str,
}

/// Output of a tool's plan builder: the computation plus the artifact
/// table.
pub struct Plan {
    pub computation: Computation,
    pub artifacts: Vec<Artifact>,
}

// The in-process computation variant holds a closure, so Debug is
// written out by hand over the artifact table.
impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("artifacts", &self.artifacts)
            .finish_non_exhaustive()
    }
}

/// A fully described invocation, ready to run.
pub struct ToolRun {
    pub tool: &'static str,
    pub staging: StagingMode,
    pub inputs: Vec<InputFile>,
    pub outputs: Vec<OutputFile>,
    pub remove_tmp: bool,
    pub restart: bool,
    /// Builds the plan from the staged view. May stage auxiliary files
    /// (e.g. parameter libraries) into `staged.dir` itself.
    pub build: Box<dyn FnOnce(&Staged) -> Result<Plan>>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub tool: String,
    /// True when restart mode found valid prior outputs and nothing
    /// was executed.
    pub skipped: bool,
    pub exit_status: i32,
    pub outputs: Vec<PathBuf>,
    /// Set when the caller asked to keep the working directory.
    pub workdir_retained: Option<PathBuf>,
}

struct WorkDirGuard {
    path: PathBuf,
    keep: bool,
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        if !self.keep {
            remove_dir_best_effort(&self.path);
        }
    }
}

/// Run one invocation through the full protocol.
pub fn run_tool(run: ToolRun) -> Result<RunReport> {
    for output in &run.outputs {
        check_extension(run.tool, output.role, &output.dest, output.accepted)?;
    }
    for input in &run.inputs {
        check_extension(run.tool, input.role, &input.source, input.accepted)?;
    }

    // Restart short-circuit: trust prior outputs on existence and
    // non-emptiness only.
    if run.restart && run.outputs.iter().all(|o| is_non_empty_file(&o.dest)) {
        tracing::info!(tool = run.tool, "restart: outputs already present, skipping execution");
        return Ok(RunReport {
            tool: run.tool.to_string(),
            skipped: true,
            exit_status: 0,
            outputs: run.outputs.into_iter().map(|o| o.dest).collect(),
            workdir_retained: None,
        });
    }

    for input in &run.inputs {
        if !input.source.is_file() {
            return Err(Error::staging(format!(
                "{}: input '{}' missing or unreadable: {}",
                run.tool,
                input.role,
                input.source.display()
            )));
        }
    }

    let workdir = create_unique_dir(&std::env::temp_dir(), run.tool)?;
    let guard = WorkDirGuard {
        path: workdir.clone(),
        keep: !run.remove_tmp,
    };
    tracing::debug!(tool = run.tool, dir = %workdir.display(), "staging working directory");

    let mut staged_inputs: BTreeMap<&'static str, String> = BTreeMap::new();
    for input in &run.inputs {
        let name = input
            .source
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                Error::staging(format!(
                    "{}: input '{}' has no usable filename: {}",
                    run.tool,
                    input.role,
                    input.source.display()
                ))
            })?
            .to_string();
        if staged_inputs.values().any(|existing| *existing == name) {
            return Err(Error::staging(format!(
                "{}: staged inputs collide on basename '{}'",
                run.tool, name
            )));
        }
        copy_into(&input.source, &workdir, &name)?;
        staged_inputs.insert(input.role, name);
    }

    let mut staged_outputs: BTreeMap<&'static str, String> = BTreeMap::new();
    for output in &run.outputs {
        let name = output
            .dest
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                Error::staging(format!(
                    "{}: output '{}' has no usable filename: {}",
                    run.tool,
                    output.role,
                    output.dest.display()
                ))
            })?
            .to_string();
        staged_outputs.insert(output.role, name);
    }

    let staged = Staged {
        dir: workdir.clone(),
        inputs: staged_inputs,
        outputs: staged_outputs,
    };

    let plan = (run.build)(&staged)?;

    let status = match plan.computation {
        Computation::Subprocess { argv, stdin_feed } => {
            if run.staging == StagingMode::Sandbox {
                verify_sandbox_argv(run.tool, &argv)?;
            }
            execute_subprocess(run.tool, &workdir, &argv, stdin_feed.as_deref())?
        }
        Computation::InProcess(compute) => {
            compute(&staged)?;
            0
        }
    };

    // Relocation: every declared output must be satisfied by a
    // produced, non-empty artifact before anything is published.
    let dest_by_role: BTreeMap<&str, &Path> = run
        .outputs
        .iter()
        .map(|o| (o.role, o.dest.as_path()))
        .collect();
    for artifact in &plan.artifacts {
        let produced = workdir.join(&artifact.staged_name);
        if !is_non_empty_file(&produced) {
            return Err(Error::output_validation(format!(
                "{}: declared output '{}' was not produced (expected artifact '{}')",
                run.tool, artifact.role, artifact.staged_name
            )));
        }
        let dest = dest_by_role.get(artifact.role).ok_or_else(|| {
            Error::output_validation(format!(
                "{}: artifact '{}' maps to undeclared output role '{}'",
                run.tool, artifact.staged_name, artifact.role
            ))
        })?;
        relocate_atomic(&produced, dest)?;
        tracing::debug!(tool = run.tool, role = artifact.role, dest = %dest.display(), "relocated output");
    }

    for output in &run.outputs {
        if !is_non_empty_file(&output.dest) {
            return Err(Error::output_validation(format!(
                "{}: declared output '{}' absent or empty after execution: {}",
                run.tool,
                output.role,
                output.dest.display()
            )));
        }
    }

    let retained = if guard.keep {
        Some(workdir.clone())
    } else {
        None
    };
    drop(guard);

    Ok(RunReport {
        tool: run.tool.to_string(),
        skipped: false,
        exit_status: status,
        outputs: run.outputs.into_iter().map(|o| o.dest).collect(),
        workdir_retained: retained,
    })
}

/// Under sandbox staging no token after the binary may contain a path
/// separator; every file reference has to be a bare filename.
fn verify_sandbox_argv(tool: &str, argv: &[String]) -> Result<()> {
    for token in argv.iter().skip(1) {
        if token.contains(std::path::MAIN_SEPARATOR) || token.contains('/') {
            return Err(Error::staging(format!(
                "{}: sandbox argument contains a path separator: '{}'",
                tool, token
            )));
        }
    }
    Ok(())
}

fn execute_subprocess(
    tool: &str,
    workdir: &Path,
    argv: &[String],
    stdin_feed: Option<&str>,
) -> Result<i32> {
    let binary = argv
        .first()
        .ok_or_else(|| Error::execution(format!("{}: empty argument vector", tool), None))?;
    tracing::info!(tool, command = ?argv, "launching");

    let mut cmd = Command::new(binary);
    cmd.args(&argv[1..])
        .current_dir(workdir)
        .stdin(if stdin_feed.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        Error::execution(format!("{}: cannot launch '{}': {}", tool, binary, e), None)
    })?;

    if let Some(feed) = stdin_feed {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(feed.as_bytes()).map_err(|e| {
                Error::execution(format!("{}: cannot feed stdin: {}", tool, e), None)
            })?;
        }
    }

    let output = child.wait_with_output().map_err(|e| {
        Error::execution(format!("{}: wait failed for '{}': {}", tool, binary, e), None)
    })?;

    let status = output.status.code().unwrap_or(-1);
    if status != 0 {
        let stderr_tail: String = String::from_utf8_lossy(&output.stderr)
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        return Err(Error::execution(
            format!(
                "{}: '{}' exited with status {}{}",
                tool,
                binary,
                status,
                if stderr_tail.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", stderr_tail)
                }
            ),
            Some(status),
        ));
    }
    tracing::info!(tool, status, "finished");
    Ok(status)
}
