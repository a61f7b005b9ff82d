//! Generated job scripts and the files a run leaves in its work directory.
//!
//! A run is described by the tool name and the run id (`"{task}-{run}"`), so
//! captured outputs of earlier runs stay side by side with the current ones.

use crate::constants::workdir::{
    CAPTURE_TAIL_LINES, END_OF_JOB_MARKER, SCIENCE_BASENAME, WRAPPER_BASENAME,
};
use crate::error::Result;
use crate::models::Task;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Paths of every file one run generates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFiles {
    workdir: PathBuf,
    name: String,
    run_id: String,
}

impl JobFiles {
    pub fn new(workdir: impl Into<PathBuf>, name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            name: name.into(),
            run_id: run_id.into(),
        }
    }

    /// Files of the task's current run
    pub fn for_task(task: &Task, workdir: impl Into<PathBuf>) -> Self {
        Self::new(workdir, task.name(), task.run_id())
    }

    /// Files of an earlier (or later) run of the task
    pub fn for_run(task: &Task, workdir: impl Into<PathBuf>, run_number: i32) -> Self {
        Self::new(workdir, task.name(), task.run_id_for(run_number))
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn file(&self, prefix: &str, kind: Option<&str>, ext: &str) -> PathBuf {
        let stem = match kind {
            Some(kind) => format!("{prefix}.{kind}.{}.{}", self.name, self.run_id),
            None => format!("{prefix}.{}.{}", self.name, self.run_id),
        };
        self.workdir.join(format!("{stem}{ext}"))
    }

    pub fn wrapper_script(&self) -> PathBuf {
        self.file(WRAPPER_BASENAME, None, ".sh")
    }

    pub fn science_script(&self) -> PathBuf {
        self.file(SCIENCE_BASENAME, None, ".sh")
    }

    pub fn wrapper_stdout(&self) -> PathBuf {
        self.file(WRAPPER_BASENAME, Some("out"), "")
    }

    pub fn wrapper_stderr(&self) -> PathBuf {
        self.file(WRAPPER_BASENAME, Some("err"), "")
    }

    pub fn science_stdout(&self) -> PathBuf {
        self.file(SCIENCE_BASENAME, Some("out"), "")
    }

    pub fn science_stderr(&self) -> PathBuf {
        self.file(SCIENCE_BASENAME, Some("err"), "")
    }

    pub fn exit_status(&self) -> PathBuf {
        self.file(WRAPPER_BASENAME, Some("exit"), "")
    }

    fn captured_outputs(&self) -> [PathBuf; 5] {
        [
            self.wrapper_stdout(),
            self.wrapper_stderr(),
            self.science_stdout(),
            self.science_stderr(),
            self.exit_status(),
        ]
    }

    /// Remove outputs a previous submission of this same run left behind;
    /// some schedulers append instead of truncating.
    pub async fn remove_stale_outputs(&self) -> Result<()> {
        for path in self.captured_outputs() {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Write both scripts for `commands`
    pub async fn write_scripts(&self, task: &Task, commands: &[String]) -> Result<()> {
        fs::write(self.science_script(), render_science_script(task, commands)).await?;
        fs::write(self.wrapper_script(), render_wrapper_script(self, task)).await?;
        set_executable(&self.wrapper_script()).await?;
        set_executable(&self.science_script()).await?;
        Ok(())
    }

    /// Whether the wrapper got to echo the end-of-job marker
    pub async fn has_end_marker(&self) -> Result<bool> {
        match fs::read_to_string(self.wrapper_stdout()).await {
            Ok(content) => Ok(content.lines().any(|line| line.trim() == END_OF_JOB_MARKER)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Exit code of the science script, once the wrapper recorded it
    pub async fn exit_code(&self) -> Result<Option<i32>> {
        match fs::read_to_string(self.exit_status()).await {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Single-quote a value for bash
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn path_arg(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

pub fn render_science_script(task: &Task, commands: &[String]) -> String {
    let mut script = format!(
        "#!/bin/bash\n\n# Commands of task '{}' (tool {}), run {}\n\n",
        task.task_id,
        task.name(),
        task.run_id()
    );
    for line in commands {
        script.push_str(line);
        script.push('\n');
    }
    script
}

/// The wrapper runs the science script with its own captured outputs,
/// records the exit code, then echoes the end-of-job marker.
pub fn render_wrapper_script(files: &JobFiles, task: &Task) -> String {
    format!(
        "#!/bin/bash\n\
         \n\
         # Wrapper for task '{task_id}', run {run_id}\n\
         \n\
         cd {workdir} || exit 20\n\
         bash {science} > {science_out} 2> {science_err}\n\
         status=$?\n\
         echo \"$status\" > {exit_file}\n\
         echo {marker}\n\
         exit $status\n",
        task_id = task.task_id,
        run_id = files.run_id(),
        workdir = path_arg(files.workdir()),
        science = path_arg(&files.science_script()),
        science_out = path_arg(&files.science_stdout()),
        science_err = path_arg(&files.science_stderr()),
        exit_file = path_arg(&files.exit_status()),
        marker = END_OF_JOB_MARKER,
    )
}

/// Tails of the captured outputs and the script texts of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub science_stdout: Option<String>,
    pub science_stderr: Option<String>,
    pub wrapper_script: Option<String>,
    pub science_script: Option<String>,
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn tail_lines(content: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Read back what a run printed, keeping the last lines of each output
pub async fn capture_job_out_err(files: &JobFiles) -> Result<CapturedOutput> {
    let tail = |content: Option<String>| content.map(|c| tail_lines(&c, CAPTURE_TAIL_LINES));
    Ok(CapturedOutput {
        stdout: tail(read_optional(&files.wrapper_stdout()).await?),
        stderr: tail(read_optional(&files.wrapper_stderr()).await?),
        science_stdout: tail(read_optional(&files.science_stdout()).await?),
        science_stderr: tail(read_optional(&files.science_stderr()).await?),
        wrapper_script: read_optional(&files.wrapper_script()).await?,
        science_script: read_optional(&files.science_script()).await?,
    })
}
