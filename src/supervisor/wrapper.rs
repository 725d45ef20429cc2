// Shell scripts run on the remote host
//
// The launch wrapper records its pid and the command's exit code through
// temp files renamed into place, so a reader sees either nothing or the
// whole value.

use std::collections::BTreeMap;

use crate::connection::{remote_join, shell_quote};
use crate::job::{JobId, ProcessReport};

/// Per-job paths under `<workspace>/.jobs/<job_id>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    run_dir: String,
}

impl RunLayout {
    pub fn new(workspace: &str, job_id: JobId) -> Self {
        Self {
            run_dir: remote_join(workspace, &format!(".jobs/{}", job_id)),
        }
    }

    pub fn from_run_dir(run_dir: impl Into<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &str {
        &self.run_dir
    }

    pub fn log(&self) -> String {
        remote_join(&self.run_dir, "training.log")
    }

    pub fn pid(&self) -> String {
        remote_join(&self.run_dir, "pid")
    }

    pub fn exit_code(&self) -> String {
        remote_join(&self.run_dir, "exit_code")
    }

    pub fn job_json(&self) -> String {
        remote_join(&self.run_dir, "job.json")
    }

    pub fn cancel_marker(&self) -> String {
        remote_join(&self.run_dir, "cancel_requested")
    }
}

/// Script run inside the detached session: record pid, run, record exit code
pub fn inner_script(layout: &RunLayout, workdir: &str, env: &BTreeMap<String, String>, command: &str) -> String {
    let pid = shell_quote(&layout.pid());
    let pid_tmp = shell_quote(&format!("{}.tmp", layout.pid()));
    let exit = shell_quote(&layout.exit_code());
    let exit_tmp = shell_quote(&format!("{}.tmp", layout.exit_code()));

    let mut script = vec![
        format!("echo $$ > {pid_tmp} && mv -f {pid_tmp} {pid}"),
        format!(
            "cd {} || {{ echo 127 > {exit_tmp} && mv -f {exit_tmp} {exit}; exit 127; }}",
            shell_quote(workdir)
        ),
    ];
    for (key, value) in env {
        script.push(format!("export {}={}", key, shell_quote(value)));
    }
    script.push(format!("sh -c {}", shell_quote(command)));
    script.push("rc=$?".to_string());
    script.push(format!("echo $rc > {exit_tmp} && mv -f {exit_tmp} {exit}"));
    script.push("exit $rc".to_string());
    script.join("\n")
}

/// Start the wrapper detached from the SSH session, appending all output to
/// the job log. Falls back to plain `nohup` where `setsid` is missing.
pub fn launch_command(layout: &RunLayout, workdir: &str, env: &BTreeMap<String, String>, command: &str) -> String {
    let inner = shell_quote(&inner_script(layout, workdir, env, command));
    let log = shell_quote(&layout.log());
    format!(
        "mkdir -p {run} && if command -v setsid >/dev/null 2>&1; then \
         setsid nohup sh -c {inner} >> {log} 2>&1 < /dev/null & \
         else nohup sh -c {inner} >> {log} 2>&1 < /dev/null & fi",
        run = shell_quote(layout.run_dir()),
        inner = inner,
        log = log,
    )
}

const EXIT_MARK: &str = "__EXIT__=";
const PID_MARK: &str = "__PID__=";
const ALIVE_MARK: &str = "__ALIVE__=";
const CANCEL_MARK: &str = "__CANCEL__=";
const SIGNALLED_MARK: &str = "__SIGNALLED__=";

/// Report pid liveness, exit file and cancel marker in one round trip.
/// Zombies count as exited.
///
/// Liveness is sampled before the exit file is read. The wrapper writes the
/// exit file before it exits, so a dead process read after the sample always
/// has its exit code visible.
pub fn status_command(layout: &RunLayout) -> String {
    [
        format!("R={}", shell_quote(layout.run_dir())),
        "PID=$(cat \"$R/pid\" 2>/dev/null)".to_string(),
        format!("echo \"{PID_MARK}$PID\""),
        "ALIVE=0".to_string(),
        "if [ -n \"$PID\" ] && kill -0 \"$PID\" 2>/dev/null; then ALIVE=1; \
         if [ -r \"/proc/$PID/stat\" ] && [ \"$(sed 's/.*) //' \"/proc/$PID/stat\" | cut -c1)\" = Z ]; then ALIVE=0; fi; fi"
            .to_string(),
        format!("echo \"{ALIVE_MARK}$ALIVE\""),
        format!("if [ -f \"$R/exit_code\" ]; then echo \"{EXIT_MARK}$(cat \"$R/exit_code\")\"; fi"),
        format!("if [ -f \"$R/cancel_requested\" ]; then echo \"{CANCEL_MARK}1\"; fi"),
    ]
    .join("\n")
}

/// Parse `status_command` output. `None` when no pid was ever recorded.
pub fn parse_status(stdout: &str) -> Option<ProcessReport> {
    let mut report = ProcessReport::default();
    let mut pid_seen = false;
    for line in stdout.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix(EXIT_MARK) {
            report.exit_code = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix(PID_MARK) {
            pid_seen = value.trim().parse::<u32>().is_ok();
        } else if let Some(value) = line.strip_prefix(ALIVE_MARK) {
            report.alive = value.trim() == "1";
        } else if line.strip_prefix(CANCEL_MARK).is_some() {
            report.cancel_requested = true;
        }
    }
    pid_seen.then_some(report)
}

/// Drop the cancel marker and signal the wrapper's process group, falling
/// back to the wrapper alone
pub fn cancel_command(layout: &RunLayout, signal: &str) -> String {
    [
        format!("R={}", shell_quote(layout.run_dir())),
        "PID=$(cat \"$R/pid\" 2>/dev/null)".to_string(),
        format!("[ -n \"$PID\" ] || {{ echo \"{SIGNALLED_MARK}0\"; exit 0; }}"),
        ": > \"$R/cancel_requested\"".to_string(),
        format!(
            "if kill -s {sig} -- \"-$PID\" 2>/dev/null || kill -s {sig} \"-$PID\" 2>/dev/null || kill -s {sig} \"$PID\" 2>/dev/null; \
             then echo \"{SIGNALLED_MARK}1\"; else echo \"{SIGNALLED_MARK}0\"; fi",
            sig = signal
        ),
    ]
    .join("\n")
}

/// Whether `cancel_command` reached a live process
pub fn parse_signalled(stdout: &str) -> bool {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(SIGNALLED_MARK))
        .any(|value| value.trim() == "1")
}

/// Last `lines` lines of the job log
pub fn tail_command(layout: &RunLayout, lines: usize) -> String {
    format!("tail -n {} {} 2>/dev/null", lines, shell_quote(&layout.log()))
}
