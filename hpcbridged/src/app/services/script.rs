// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Batch script rendering.
//!
//! Every value that reaches the run line goes through [`sh_escape`]; the invocation is
//! modelled as tokens rather than a text template so there is no unescaped path from a
//! parameter value into the script. `#SBATCH` lines are parsed by Slurm, not the shell,
//! and sbatch splits them on whitespace, so their values are limited to a plain
//! identifier alphabet instead.

use std::fmt::Write as _;

use crate::app::errors::{AppError, AppResult};
use crate::app::services::remote_path::{
    FILES_DIR_NAME, STDERR_FILE_NAME, STDOUT_FILE_NAME, contained_path, relative_to,
};
use crate::app::services::shell::sh_escape;
use crate::app::types::{
    Application, InvocationToken, Job, ParameterSpec, ParameterValue, ResourceRequest, ToolBackend,
};

/// Mount point of the job's `files/` directory inside the container.
pub const CONTAINER_WORKDIR: &str = "/work";

/// Renders the submission script for `job`. `working_dir` is the job's root directory
/// (`<root>/<system_id>`); the tool runs inside its `files/` subdirectory.
pub fn generate(job: &Job, account: &str, working_dir: &str) -> AppResult<String> {
    check_directive_value("account", account)?;
    check_directive_value("job name", &job.system_id)?;
    check_resources(&job.resources)?;

    let files_dir = format!("{}/{}", working_dir.trim_end_matches('/'), FILES_DIR_NAME);
    let args = resolve_invocation(&job.application, job, &files_dir)?;
    let container = container_invocation(&job.application, &files_dir, &args);

    let mut script = String::from("#!/bin/bash\n");
    // writes into a String cannot fail
    let _ = writeln!(script, "#SBATCH --account={account}");
    let _ = writeln!(script, "#SBATCH --job-name={}", job.system_id);
    let _ = writeln!(script, "#SBATCH --nodes={}", job.resources.nodes);
    let _ = writeln!(
        script,
        "#SBATCH --ntasks-per-node={}",
        job.resources.tasks_per_node
    );
    let _ = writeln!(script, "#SBATCH --time={}", job.resources.max_time);
    script.push('\n');

    for module in modules_for(&job.application) {
        let _ = writeln!(script, "module load {}", sh_escape(&module));
    }
    script.push('\n');

    let _ = writeln!(
        script,
        "srun {container} > {} 2> {}",
        sh_escape(&format!("{files_dir}/{STDOUT_FILE_NAME}")),
        sh_escape(&format!("{files_dir}/{STDERR_FILE_NAME}")),
    );
    Ok(script)
}

fn check_directive_value(what: &str, value: &str) -> AppResult<()> {
    if value.is_empty() {
        return Err(AppError::invalid_argument(format!("{what} must not be empty")));
    }
    if !value.chars().all(is_directive_char) {
        return Err(AppError::invalid_argument(format!(
            "{what} '{}' may only contain letters, digits, '.', '_' and '-'",
            value.escape_debug()
        )));
    }
    Ok(())
}

fn is_directive_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn check_resources(resources: &ResourceRequest) -> AppResult<()> {
    if resources.nodes == 0 {
        return Err(AppError::invalid_argument("node count must be at least 1"));
    }
    if resources.tasks_per_node == 0 {
        return Err(AppError::invalid_argument(
            "tasks per node must be at least 1",
        ));
    }
    if resources.max_time.total_seconds() == 0 {
        return Err(AppError::invalid_argument("wall-clock limit must be positive"));
    }
    if resources.max_time.minutes >= 60 || resources.max_time.seconds >= 60 {
        return Err(AppError::invalid_argument(format!(
            "wall-clock limit {} is not a valid duration",
            resources.max_time
        )));
    }
    Ok(())
}

/// Declared modules first, then backend-implied ones not already present.
fn modules_for(app: &Application) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    let implied = app
        .tool
        .backend
        .implied_modules()
        .iter()
        .map(|m| m.to_string());
    for module in app.tool.required_modules.iter().cloned().chain(implied) {
        if !modules.contains(&module) {
            modules.push(module);
        }
    }
    modules
}

fn container_invocation(app: &Application, files_dir: &str, args: &[String]) -> String {
    let mut words = match app.tool.backend {
        ToolBackend::Singularity => format!(
            "singularity exec --containall --bind {} --pwd {CONTAINER_WORKDIR} {}",
            sh_escape(&format!("{files_dir}:{CONTAINER_WORKDIR}")),
            sh_escape(&app.tool.container),
        ),
        ToolBackend::Udocker => format!(
            "udocker run --rm {} {} {}",
            sh_escape(&format!("--volume={files_dir}:{CONTAINER_WORKDIR}")),
            sh_escape(&format!("--workdir={CONTAINER_WORKDIR}")),
            sh_escape(&app.tool.container),
        ),
    };
    for arg in args {
        words.push(' ');
        words.push_str(&sh_escape(arg));
    }
    words
}

/// Unescaped argument list; escaping happens when the run line is assembled.
fn resolve_invocation(app: &Application, job: &Job, files_dir: &str) -> AppResult<Vec<String>> {
    let mut args = Vec::with_capacity(app.invocation.len());
    for token in &app.invocation {
        match token {
            InvocationToken::Word { word } => args.push(word.clone()),
            InvocationToken::Variable {
                name,
                prefix,
                suffix,
            } => {
                let Some(value) = parameter_value(app, job, name)? else {
                    continue;
                };
                let rendered = render_value(name, value, files_dir)?;
                args.push(format!("{prefix}{rendered}{suffix}"));
            }
            InvocationToken::Flag { name, flag } => match parameter_value(app, job, name)? {
                Some(ParameterValue::Boolean { value: true }) => args.push(flag.clone()),
                Some(ParameterValue::Boolean { value: false }) | None => {}
                Some(_) => {
                    return Err(AppError::invalid_argument(format!(
                        "parameter '{name}' must be a boolean"
                    )));
                }
            },
        }
    }
    Ok(args)
}

/// Supplied value, else declared default. `None` only for optional parameters.
fn parameter_value<'a>(
    app: &'a Application,
    job: &'a Job,
    name: &str,
) -> AppResult<Option<&'a ParameterValue>> {
    let spec: Option<&ParameterSpec> = app.parameters.iter().find(|p| p.name == name);
    if let Some(value) = job.parameters.get(name) {
        return Ok(Some(value));
    }
    match spec {
        Some(spec) => match &spec.default_value {
            Some(default) => Ok(Some(default)),
            None if spec.optional => Ok(None),
            None => Err(missing_parameter(name)),
        },
        None => Err(missing_parameter(name)),
    }
}

fn missing_parameter(name: &str) -> AppError {
    AppError::invalid_argument(format!("missing required parameter '{name}'"))
}

fn render_value(name: &str, value: &ParameterValue, files_dir: &str) -> AppResult<String> {
    Ok(match value {
        ParameterValue::Text { value } => value.clone(),
        ParameterValue::Integer { value } => value.to_string(),
        ParameterValue::FloatingPoint { value } => {
            if !value.is_finite() {
                return Err(AppError::invalid_argument(format!(
                    "parameter '{name}' is not a finite number"
                )));
            }
            value.to_string()
        }
        ParameterValue::Boolean { value } => value.to_string(),
        ParameterValue::InputFile { destination } => {
            let host_path = contained_path(files_dir, destination)?;
            let relative = relative_to(files_dir, &host_path).ok_or_else(|| {
                AppError::invalid_argument(format!("input file '{destination}' is not a file path"))
            })?;
            format!("{CONTAINER_WORKDIR}/{relative}")
        }
    })
}
