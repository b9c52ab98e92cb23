//! Plugin command probe.
//!
//! Runs an external command and turns each stdout line
//! (`name \t value \t unix_seconds [\t k=v ...]`) into one sample.
//! The child gets a private content-addressed `TMPDIR`, is sent
//! SIGTERM on deadline and SIGKILL after a five second grace period.
//! With `graph_defs: true` the command is re-executed once per config
//! per process lifetime with `MACKEREL_AGENT_PLUGIN_META=1` to publish
//! its graph definitions, and sample names gain the `custom.` prefix.

use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, trace, warn};

use super::{new_metric, ProbeError, ProbeResult};
use crate::client::{Client, GraphDefsMetric, GraphDefsParam, Host};
use crate::config::duration_opt;
use crate::metric::parse_metric_line;
use crate::template;

pub const CUSTOM_PREFIX: &str = "custom.";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);
const GRAPH_DEFS_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(5);
const PLUGIN_META_HEADER: &str = "# mackerel-agent-plugin";

static GRAPH_DEFS_POSTED: Lazy<DashSet<String>> = Lazy::new(DashSet::new);

/// The `command` key accepts a single string (re-tokenized through
/// `sh -c` when it contains whitespace) or an array of argv elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandProbeConfig {
    pub command: CommandSpec,
    #[serde(default, with = "duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub graph_defs: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(skip)]
    argv: Vec<String>,
}

impl CommandProbeConfig {
    pub(crate) fn initialize(&mut self) -> Result<(), ProbeError> {
        self.argv = match &self.command {
            CommandSpec::Line(s) if s.is_empty() => {
                return Err(ProbeError::Config("command is empty string".to_string()))
            }
            CommandSpec::Line(s) => vec![s.clone()],
            CommandSpec::Argv(argv) if argv.is_empty() => {
                return Err(ProbeError::Config("command is empty array".to_string()))
            }
            CommandSpec::Argv(argv) => argv.clone(),
        };
        Ok(())
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Process-wide identity for the graph-defs once-per-config cache.
    fn graph_defs_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn generate_probe(&self, host: &Host) -> Result<CommandProbe, ProbeError> {
        let value = host.template_value();
        let env = if self.env.is_empty() {
            None
        } else {
            Some(&self.env)
        };
        let mut command = Vec::with_capacity(self.argv.len());
        for arg in &self.argv {
            command.push(template::expand(arg, Some(&value), env)?);
        }
        if command.len() == 1 && command[0].contains(' ') {
            command = vec!["sh".to_string(), "-c".to_string(), command.remove(0)];
        }
        Ok(CommandProbe {
            command,
            timeout: self.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            graph_defs: self.graph_defs,
            env: self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            graph_defs_key: self.graph_defs_key(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandProbe {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub graph_defs: bool,
    // ordered so the serialized identity (and thus TMPDIR) is stable
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(skip)]
    graph_defs_key: String,
}

#[derive(Debug, Deserialize)]
struct GraphsOutput {
    graphs: HashMap<String, GraphDef>,
}

#[derive(Debug, Deserialize)]
struct GraphDef {
    #[serde(default)]
    label: String,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    metrics: Vec<GraphDefMetric>,
}

#[derive(Debug, Deserialize)]
struct GraphDefMetric {
    name: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    stacked: bool,
}

impl CommandProbe {
    /// Deliberately ignores the caller's cancellation: a shutdown must
    /// not kill a plugin halfway through printing its samples. The
    /// probe's own deadline still applies.
    pub async fn run(&self) -> ProbeResult {
        let start = Instant::now();
        let mut ms = Vec::new();
        let outcome = self.attempt(&mut ms).await;
        ms.push(new_metric("", "check.ok", if outcome.is_ok() { 1.0 } else { 0.0 }));
        ms.push(new_metric("", "elapsed.seconds", start.elapsed().as_secs_f64()));
        ProbeResult {
            metrics: ms,
            error: outcome.err(),
        }
    }

    async fn attempt(&self, ms: &mut Vec<crate::metric::Metric>) -> Result<(), ProbeError> {
        let start = Instant::now();
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .envs(&self.env)
            .env("TMPDIR", self.temp_dir())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|e| {
            ProbeError::Command(format!(
                "command execute failed. {}: {e}",
                self.command.join(" ")
            ))
        })?;
        let stdout = child.stdout.take().expect("stdout is piped");
        let mut lines = BufReader::new(stdout).lines();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        trace!(%line, "plugin output");
                        match parse_metric_line(&line) {
                            Ok(mut m) => {
                                if self.graph_defs {
                                    m.name = format!("{CUSTOM_PREFIX}{}", m.name);
                                }
                                ms.push(m);
                            }
                            Err(err) => {
                                warn!(command = %self.command.join(" "), %err, "failed to parse metric line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, "failed to read plugin output");
                        break;
                    }
                },
                _ = &mut deadline => {
                    terminate_with_grace(&mut child).await;
                    return Err(ProbeError::Timeout(self.timeout));
                }
            }
        }

        let remaining = self.timeout.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(ProbeError::Command(format!(
                "command execute failed: {status}"
            ))),
            Ok(Err(err)) => Err(ProbeError::Command(err.to_string())),
            Err(_) => {
                terminate_with_grace(&mut child).await;
                Err(ProbeError::Timeout(self.timeout))
            }
        }
    }

    /// Private TMPDIR shared by concurrent runs of the same probe,
    /// addressed by the SHA-256 of the probe's JSON identity.
    pub fn temp_dir(&self) -> PathBuf {
        let identity = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(identity.as_bytes());
        let dir = std::env::temp_dir().join(format!("mkrprobe_command_{digest:x}"));
        match std::fs::DirBuilder::new().mode(0o700).create(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), command = %self.command.join(" "), "created TMPDIR");
                dir
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => dir,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "failed to create TMPDIR, using the system default");
                std::env::temp_dir()
            }
        }
    }

    /// Publish graph definitions at most once per config per process.
    /// A malformed plugin response is cached as attempted; a failure to
    /// reach the API is not, so the next tick retries.
    pub async fn post_graph_defs(&self, client: &Client) -> Result<(), ProbeError> {
        if GRAPH_DEFS_POSTED.contains(&self.graph_defs_key) {
            trace!(command = %self.command.join(" "), "graph defs already posted");
            return Ok(());
        }

        let out = match self.get_graph_defs().await {
            Ok(out) => out,
            Err(err) => {
                GRAPH_DEFS_POSTED.insert(self.graph_defs_key.clone());
                return Err(err);
            }
        };

        let mut payloads = Vec::with_capacity(out.graphs.len());
        for (graph_name, g) in &out.graphs {
            let name = format!("{CUSTOM_PREFIX}{graph_name}");
            payloads.push(GraphDefsParam {
                metrics: g
                    .metrics
                    .iter()
                    .map(|m| GraphDefsMetric {
                        name: format!("{name}.{}", m.name),
                        display_name: m.label.clone(),
                        is_stacked: m.stacked,
                    })
                    .collect(),
                name,
                display_name: g.label.clone(),
                unit: g.unit.clone(),
            });
        }
        client
            .create_graph_defs(&payloads)
            .await
            .map_err(|e| ProbeError::Command(format!("could not create graph defs: {e}")))?;
        info!(command = %self.command.join(" "), "created graph defs");

        GRAPH_DEFS_POSTED.insert(self.graph_defs_key.clone());
        Ok(())
    }

    async fn get_graph_defs(&self) -> Result<GraphsOutput, ProbeError> {
        trace!(command = %self.command.join(" "), "get graph defs");
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .env("MACKEREL_AGENT_PLUGIN_META", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd
            .spawn()
            .map_err(|e| ProbeError::Command(format!("command execute failed: {e}")))?;
        let stdout = child.stdout.take().expect("stdout is piped");
        let mut reader = BufReader::new(stdout);

        let read = async {
            let mut header = String::new();
            reader
                .read_line(&mut header)
                .await
                .map_err(|e| ProbeError::Command(format!("could not fetch a first line: {e}")))?;
            if header.trim_end_matches('\n') != PLUGIN_META_HEADER {
                return Err(ProbeError::Command(format!(
                    "{} didn't output graph defs",
                    self.command[0]
                )));
            }
            let mut rest = String::new();
            reader
                .read_to_string(&mut rest)
                .await
                .map_err(|e| ProbeError::Command(e.to_string()))?;
            serde_json::from_str::<GraphsOutput>(&rest)
                .map_err(|e| ProbeError::Command(format!("could not decode graph defs output: {e}")))
        };

        let result = match tokio::time::timeout(GRAPH_DEFS_TIMEOUT, read).await {
            Ok(r) => r,
            Err(_) => {
                terminate_with_grace(&mut child).await;
                return Err(ProbeError::Timeout(GRAPH_DEFS_TIMEOUT));
            }
        };
        let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        result
    }
}

/// SIGTERM, then SIGKILL if the child has not exited after the grace
/// period.
async fn terminate_with_grace(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    const PLUGIN: &str = "./test/command-plugin";

    fn config(command: CommandSpec, graph_defs: bool) -> CommandProbeConfig {
        let mut pc = CommandProbeConfig {
            command,
            timeout: Some(Duration::from_secs(10)),
            graph_defs,
            env: HashMap::new(),
            argv: Vec::new(),
        };
        pc.initialize().unwrap();
        pc
    }

    fn host(id: &str) -> Host {
        Host {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plugin_lines_become_samples() {
        let pc = config(CommandSpec::Argv(vec![PLUGIN.to_string()]), false);
        let p = pc.generate_probe(&host("test")).unwrap();
        let result = p.run().await;
        assert!(result.error.is_none(), "error: {:?}", result.error);

        let m = result
            .metrics
            .iter()
            .find(|m| m.name == "test.test.ok")
            .expect("plugin sample present");
        assert_eq!(m.value, 1.0);
        assert_eq!(m.timestamp.timestamp(), 1523261168);

        let by_name: Map<_, _> = result.metrics.iter().map(|m| (m.name.as_str(), m.value)).collect();
        assert_eq!(by_name["check.ok"], 1.0);
        assert!(by_name.contains_key("elapsed.seconds"));
    }

    #[tokio::test]
    async fn graph_defs_mode_prefixes_sample_names() {
        let pc = config(CommandSpec::Argv(vec![PLUGIN.to_string()]), true);
        let p = pc.generate_probe(&host("test")).unwrap();
        let result = p.run().await;
        assert!(result
            .metrics
            .iter()
            .any(|m| m.name == "custom.test.test.ok"));
    }

    #[tokio::test]
    async fn single_string_with_spaces_runs_through_sh() {
        let pc = config(
            CommandSpec::Line(format!("{PLUGIN} {{{{ .Host.ID }}}}")),
            false,
        );
        let p = pc.generate_probe(&host("test")).unwrap();
        assert_eq!(p.command[0], "sh");
        assert_eq!(p.command[1], "-c");
        assert!(p.command[2].ends_with("command-plugin test"));

        let result = p.run().await;
        assert!(result.error.is_none(), "error: {:?}", result.error);
        assert!(result.metrics.iter().any(|m| m.name == "test.test.ok"));
    }

    #[tokio::test]
    async fn probe_env_reaches_the_child() {
        let mut pc = config(CommandSpec::Argv(vec![PLUGIN.to_string()]), false);
        pc.env.insert("TEST_ENV_METRIC".to_string(), "42".to_string());
        let p = pc.generate_probe(&host("test")).unwrap();
        let result = p.run().await;
        let m = result
            .metrics
            .iter()
            .find(|m| m.name == "test.env.value")
            .expect("env-driven sample present");
        assert_eq!(m.value, 42.0);
    }

    #[tokio::test]
    async fn deadline_terminates_the_child() {
        let pc = {
            let mut pc = config(CommandSpec::Argv(vec!["sleep".to_string(), "30".to_string()]), false);
            pc.timeout = Some(Duration::from_millis(200));
            pc
        };
        let p = pc.generate_probe(&host("test")).unwrap();
        let start = Instant::now();
        let result = p.run().await;
        assert!(matches!(result.error, Some(ProbeError::Timeout(_))));
        // SIGTERM ends `sleep` immediately, well before the kill grace
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn graph_defs_output_parses() {
        let pc = config(CommandSpec::Argv(vec![PLUGIN.to_string()]), true);
        let p = pc.generate_probe(&host("test")).unwrap();
        let out = p.get_graph_defs().await.unwrap();
        let graph = &out.graphs["test"];
        assert_eq!(graph.label, "Test");
        assert_eq!(graph.metrics[0].name, "ok");
    }

    #[tokio::test]
    async fn non_plugin_command_is_not_graph_defs() {
        let pc = config(
            CommandSpec::Argv(vec!["echo".to_string(), "hello".to_string()]),
            true,
        );
        let p = pc.generate_probe(&host("test")).unwrap();
        assert!(p.get_graph_defs().await.is_err());
    }

    #[test]
    fn temp_dir_is_stable_and_private() {
        let pc = config(CommandSpec::Argv(vec![PLUGIN.to_string()]), false);
        let p = pc.generate_probe(&host("test")).unwrap();
        let a = p.temp_dir();
        let b = p.temp_dir();
        assert_eq!(a, b);
        assert!(a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("mkrprobe_command_"));
        let mode = std::fs::metadata(&a).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(mode.mode() & 0o777, 0o700);
    }
}
